//! Line-oriented console front end: renders [`UiUpdate`]s as text and turns
//! typed commands into session events.

use std::io::{self, Write};

use puzzle_proto::{Question, Winner};

use crate::board::PointerEvent;
use crate::driver::GameView;
use crate::quiz::Feedback;
use crate::session::{Event, UiUpdate};

pub const HELP: &str = "\
commands:
  name <NAME>       register or resume as NAME
  click <X> <Y>     click the puzzle image at pixel X,Y (image is 512x512)
  cell <INDEX>      pick a tile by index (row-major, from 0)
  validate          check whether the puzzle is solved
  answer <Q> <O>    choose option O for question Q (both from 1)
  submit            submit your quiz answers
  next              continue to the next level
  restart           restart the current level
  new               forget this player and start over
  help              show this list
  quit              leave the game";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Game(Event),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command '{0}'; type 'help' for a list")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();
    let command = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "name" | "register" => Command::Game(Event::SubmitName(rest.to_string())),
        "click" => match args.as_slice() {
            [x, y] => {
                let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) else {
                    return Err(ParseError::Usage("click <X> <Y>"));
                };
                Command::Game(Event::Click(PointerEvent { x, y }))
            }
            _ => return Err(ParseError::Usage("click <X> <Y>")),
        },
        "cell" | "tile" => match args.as_slice() {
            [index] => Command::Game(Event::SelectCell(
                index.parse().map_err(|_| ParseError::Usage("cell <INDEX>"))?,
            )),
            _ => return Err(ParseError::Usage("cell <INDEX>")),
        },
        "validate" | "check" => Command::Game(Event::Validate),
        "answer" => match args.as_slice() {
            [question, option] => {
                let parse = |value: &str| {
                    value
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| n.checked_sub(1))
                        .ok_or(ParseError::Usage("answer <QUESTION> <OPTION>"))
                };
                Command::Game(Event::ChooseAnswer {
                    question: parse(question)?,
                    option: parse(option)?,
                })
            }
            _ => return Err(ParseError::Usage("answer <QUESTION> <OPTION>")),
        },
        "submit" => Command::Game(Event::SubmitAnswers),
        "next" => Command::Game(Event::NextLevel),
        "restart" => Command::Game(Event::RestartLevel),
        "new" => Command::Game(Event::NewGame),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Writes updates to any [`Write`]; stdout in the real client.
pub struct ConsoleView<W> {
    out: W,
    server: String,
    grid_size: usize,
}

impl ConsoleView<io::Stdout> {
    pub fn stdout(server: impl Into<String>) -> Self {
        Self::new(io::stdout(), server)
    }
}

impl<W: Write> ConsoleView<W> {
    pub fn new(out: W, server: impl Into<String>) -> Self {
        Self {
            out,
            server: server.into(),
            grid_size: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.server.trim_end_matches('/'), url)
        }
    }

    fn write_update(&mut self, update: &UiUpdate) -> io::Result<()> {
        let out = &mut self.out;
        match update {
            UiUpdate::InlineError(message) => writeln!(out, "  ! {message}"),
            UiUpdate::Alert(message) => writeln!(out, "[error] {message}"),
            UiUpdate::Notice(message) => writeln!(out, "  {message}"),
            UiUpdate::Welcome {
                username,
                returning,
                total_score,
                completed_levels,
            } => {
                if *returning {
                    writeln!(out, "Welcome back, {username}!")?;
                    if let Some(score) = total_score {
                        writeln!(out, "  total score so far: {score:.1}")?;
                    }
                    if !completed_levels.is_empty() {
                        writeln!(out, "  completed: {}", completed_levels.join(", "))?;
                    }
                    Ok(())
                } else {
                    writeln!(out, "Welcome, {username}!")
                }
            }
            UiUpdate::LevelStarted { level } => writeln!(out, "== {} ==", level_label(level)),
            UiUpdate::ShowImage {
                url,
                organ,
                modality,
            } => {
                let url = self.absolute(url);
                let out = &mut self.out;
                writeln!(out, "image: {url}")?;
                match (organ, modality) {
                    (Some(organ), Some(modality)) => writeln!(out, "  {organ}, {modality}"),
                    (Some(label), None) | (None, Some(label)) => writeln!(out, "  {label}"),
                    (None, None) => Ok(()),
                }
            }
            UiUpdate::Countdown(0) => writeln!(out, "Go!"),
            UiUpdate::Countdown(remaining) => writeln!(out, "shuffling in {remaining}..."),
            UiUpdate::TimeRemaining(remaining) => {
                if *remaining % 30 == 0 || *remaining <= 10 {
                    writeln!(out, "  time left: {}", format_clock(*remaining))
                } else {
                    Ok(())
                }
            }
            UiUpdate::ShowBoard { url, grid_size } => {
                self.grid_size = *grid_size;
                let url = self.absolute(url);
                let grid = render_grid(*grid_size, None);
                let out = &mut self.out;
                writeln!(out, "puzzle ({grid_size}x{grid_size}): {url}")?;
                write!(out, "{grid}")
            }
            UiUpdate::TileSelected(index) => {
                let grid = render_grid(self.grid_size, Some(*index));
                let out = &mut self.out;
                writeln!(out, "  tile {index} selected")?;
                write!(out, "{grid}")
            }
            UiUpdate::SelectionCleared => Ok(()),
            UiUpdate::BoardUpdated { url } => {
                let url = self.absolute(url);
                writeln!(self.out, "  board: {url}")
            }
            UiUpdate::PuzzleChecked { correct: true } => {
                writeln!(out, "Puzzle solved! Answer the questions, then 'submit'.")
            }
            UiUpdate::PuzzleChecked { correct: false } => {
                writeln!(out, "Not quite; keep swapping tiles.")
            }
            UiUpdate::ShowQuiz(questions) => write_questions(out, questions),
            UiUpdate::AnswerChosen { question, option } => {
                writeln!(out, "  answer {} -> {}", question + 1, option + 1)
            }
            UiUpdate::QuizGraded(grade) => {
                writeln!(out, "score: {}/{}", grade.score, grade.total)?;
                for (index, feedback) in grade.feedback.iter().enumerate() {
                    match feedback {
                        Feedback::Correct => writeln!(out, "  {}. correct", index + 1)?,
                        Feedback::Incorrect { correct_answer } => writeln!(
                            out,
                            "  {}. wrong, the answer is {correct_answer}",
                            index + 1
                        )?,
                        Feedback::Ungraded => writeln!(out, "  {}. not graded", index + 1)?,
                    }
                }
                writeln!(out, "Type 'next' to continue.")
            }
            UiUpdate::ScoreSaved {
                weighted_score,
                total_score,
            } => match (weighted_score, total_score) {
                (Some(weighted), Some(total)) => {
                    writeln!(out, "  saved {weighted:.1} points, total {total:.1}")
                }
                _ => writeln!(out, "  score saved"),
            },
            UiUpdate::TimedOut => writeln!(out, "Time's up! Type 'restart' to try again."),
            UiUpdate::Completed(message) => writeln!(out, "{message}"),
            UiUpdate::Reset => writeln!(out, "Enter your name with 'name <NAME>'."),
        }
    }
}

impl<W: Write + Send> GameView for ConsoleView<W> {
    fn render(&mut self, update: &UiUpdate) {
        if let Err(err) = self.write_update(update).and_then(|_| self.out.flush()) {
            tracing::warn!(target: "puzzle::console", error = %err, "failed to write to console");
        }
    }
}

fn level_label(level: &str) -> String {
    match level.strip_prefix("level_") {
        Some(number) => format!("Level {number}"),
        None => level.to_string(),
    }
}

fn format_clock(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn render_grid(grid_size: usize, selected: Option<usize>) -> String {
    let width = (grid_size * grid_size).saturating_sub(1).to_string().len();
    let mut grid = String::new();
    for row in 0..grid_size {
        grid.push_str("   ");
        for column in 0..grid_size {
            let index = row * grid_size + column;
            if selected == Some(index) {
                grid.push_str(&format!("[{index:>width$}]"));
            } else {
                grid.push_str(&format!(" {index:>width$} "));
            }
        }
        grid.push('\n');
    }
    grid
}

fn write_questions(out: &mut impl Write, questions: &[Question]) -> io::Result<()> {
    if questions.is_empty() {
        return writeln!(out, "No questions for this image.");
    }
    writeln!(out, "Questions:")?;
    for (number, question) in questions.iter().enumerate() {
        writeln!(out, "  {}. {}", number + 1, question.question)?;
        for (option, text) in question.options.iter().enumerate() {
            writeln!(out, "     {}) {text}", option + 1)?;
        }
    }
    Ok(())
}

pub fn write_winners(
    out: &mut impl Write,
    winners: &[Winner],
    message: Option<&str>,
) -> io::Result<()> {
    if winners.is_empty() {
        return writeln!(out, "{}", message.unwrap_or("No winners yet."));
    }
    writeln!(out, "Top players:")?;
    for (rank, winner) in winners.iter().enumerate() {
        writeln!(
            out,
            "  {}. {:<20} {:>8.1}",
            rank + 1,
            winner.username,
            winner.total_score
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::QuizGrade;

    fn rendered(updates: &[UiUpdate]) -> String {
        let mut view = ConsoleView::new(Vec::new(), "http://127.0.0.1:8000/");
        for update in updates {
            view.render(update);
        }
        String::from_utf8(view.into_inner()).unwrap()
    }

    #[test]
    fn parses_game_commands() {
        assert_eq!(
            parse_command("name  Ann Lee ").unwrap(),
            Some(Command::Game(Event::SubmitName("Ann Lee".into())))
        );
        assert_eq!(
            parse_command("click 10 200.5").unwrap(),
            Some(Command::Game(Event::Click(PointerEvent { x: 10.0, y: 200.5 })))
        );
        assert_eq!(
            parse_command("answer 2 3").unwrap(),
            Some(Command::Game(Event::ChooseAnswer {
                question: 1,
                option: 2
            }))
        );
        assert_eq!(
            parse_command("CELL 7").unwrap(),
            Some(Command::Game(Event::SelectCell(7)))
        );
        assert_eq!(parse_command("quit").unwrap(), Some(Command::Quit));
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            parse_command("answer 0 1"),
            Err(ParseError::Usage("answer <QUESTION> <OPTION>"))
        );
        assert_eq!(parse_command("click 1"), Err(ParseError::Usage("click <X> <Y>")));
        assert!(matches!(parse_command("fly"), Err(ParseError::Unknown(_))));
    }

    #[test]
    fn renders_relative_urls_against_server() {
        let text = rendered(&[UiUpdate::ShowImage {
            url: "/static/images/level_1/heart.jpg".into(),
            organ: Some("Heart".into()),
            modality: Some("MRI".into()),
        }]);
        assert!(text.contains("http://127.0.0.1:8000/static/images/level_1/heart.jpg"));
        assert!(text.contains("Heart, MRI"));
    }

    #[test]
    fn renders_selection_on_grid() {
        let text = rendered(&[
            UiUpdate::ShowBoard {
                url: "/tmp.jpg".into(),
                grid_size: 2,
            },
            UiUpdate::TileSelected(3),
        ]);
        assert!(text.contains("[3]"));
    }

    #[test]
    fn renders_grade_feedback() {
        let text = rendered(&[UiUpdate::QuizGraded(QuizGrade {
            score: 1,
            total: 2,
            feedback: vec![
                Feedback::Correct,
                Feedback::Incorrect {
                    correct_answer: "MRI".into(),
                },
            ],
        })]);
        assert!(text.contains("score: 1/2"));
        assert!(text.contains("the answer is MRI"));
    }

    #[test]
    fn winners_table() {
        let mut out = Vec::new();
        write_winners(&mut out, &[], Some("No winners yet")).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No winners yet\n");

        let mut out = Vec::new();
        write_winners(
            &mut out,
            &[Winner {
                username: "Alice".into(),
                player_id: None,
                total_score: 42.5,
                start_time: None,
                end_time: None,
            }],
            None,
        )
        .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("1. Alice"));
    }
}
