//! Level session state machine.
//!
//! [`GameSession`] owns every piece of per-game state and exposes a single
//! transition function, [`GameSession::handle`]. It performs no I/O: each
//! call returns the [`Effect`]s (network requests, timer commands, profile
//! writes, view updates) the driver must carry out, and the driver feeds
//! the outcome back in as another [`Event`].

use std::fmt;

use puzzle_proto::{
    CheckAnswersReply, CheckAnswersRequest, ImageReply, NextLevelReply, Question, QuestionsReply,
    RegisterReply, SaveScoreReply, SaveScoreRequest, ShuffleReply, SwapReply, SwapRequest,
    ValidateReply,
};
use tracing::{debug, info, warn};

use crate::board::{BoardController, Bounds, ClickOutcome, PointerEvent, IMAGE_SIDE_PX};
use crate::config::GameConfig;
use crate::profile::PlayerProfile;
use crate::quiz::{QuizController, QuizGrade};
use crate::timer::{TimerCommand, TimerKind};

/// Reply of a network call, or the transport failure rendered as text.
pub type Fetched<T> = Result<T, String>;

const EXHAUSTED_MARKER: &str = "No images";
const COMPLETION_MESSAGE: &str = "Congratulations! You have completed all levels.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayPhase {
    ImageLoading,
    CountdownRunning,
    Shuffling,
    Interactive,
    Validating,
    /// A load or shuffle failed with no automatic recovery left; only a
    /// level restart moves on.
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Idle,
    Registering,
    Playing(PlayPhase),
    QuizActive,
    QuizGraded,
    Advancing,
    Completed,
    TimedOut,
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GameState::Idle => "idle",
            GameState::Registering => "registering",
            GameState::Playing(PlayPhase::ImageLoading) => "loading the image",
            GameState::Playing(PlayPhase::CountdownRunning) => "counting down",
            GameState::Playing(PlayPhase::Shuffling) => "shuffling",
            GameState::Playing(PlayPhase::Interactive) => "solving the puzzle",
            GameState::Playing(PlayPhase::Validating) => "validating",
            GameState::Playing(PlayPhase::Stalled) => "stalled",
            GameState::QuizActive => "answering the quiz",
            GameState::QuizGraded => "reviewing quiz results",
            GameState::Advancing => "advancing",
            GameState::Completed => "completed",
            GameState::TimedOut => "timed out",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {action} while {state}")]
    Rejected {
        state: GameState,
        action: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("Username must be at least 3 characters long")]
    TooShort,
    #[error("Username must contain only letters and spaces")]
    InvalidCharacters,
}

/// Trims `raw` and checks it is a usable display name.
pub fn validate_username(raw: &str) -> Result<String, NameError> {
    let name = raw.trim();
    if name.chars().count() < 3 {
        return Err(NameError::TooShort);
    }
    if !name.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return Err(NameError::InvalidCharacters);
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // player actions
    SubmitName(String),
    Click(PointerEvent),
    SelectCell(usize),
    Validate,
    ChooseAnswer { question: usize, option: usize },
    SubmitAnswers,
    NextLevel,
    RestartLevel,
    NewGame,
    // timers; zero means the timer ran out
    CountdownTick(u32),
    TimeoutTick(u32),
    // replies
    Registered(Fetched<RegisterReply>),
    ImageLoaded(Fetched<ImageReply>),
    QuestionsLoaded {
        generation: u64,
        reply: Fetched<QuestionsReply>,
    },
    Shuffled(Fetched<ShuffleReply>),
    Swapped(Fetched<SwapReply>),
    Validated(Fetched<ValidateReply>),
    AnswersChecked(Fetched<CheckAnswersReply>),
    ScoreSaved(Fetched<SaveScoreReply>),
    LevelAdvanced(Fetched<NextLevelReply>),
}

impl Event {
    /// Whether the player asked for this, as opposed to a timer or a reply.
    pub fn is_player_action(&self) -> bool {
        matches!(
            self,
            Event::SubmitName(_)
                | Event::Click(_)
                | Event::SelectCell(_)
                | Event::Validate
                | Event::ChooseAnswer { .. }
                | Event::SubmitAnswers
                | Event::NextLevel
                | Event::RestartLevel
                | Event::NewGame
        )
    }

    /// Player actions that abandon whatever the current request was for.
    pub fn interrupts(&self) -> bool {
        matches!(self, Event::RestartLevel | Event::NewGame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { username: String },
    Image,
    /// Runs in the background; the reply is tagged with `generation`.
    Questions { generation: u64 },
    Shuffle,
    Swap(SwapRequest),
    Validate,
    CheckAnswers(CheckAnswersRequest),
    SaveScore(SaveScoreRequest),
    NextLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileUpdate {
    Save(PlayerProfile),
    Clear,
}

/// What the player sees change.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// Validation message next to the input; nothing was sent.
    InlineError(String),
    /// Blocking error.
    Alert(String),
    Notice(String),
    Welcome {
        username: String,
        returning: bool,
        total_score: Option<f64>,
        completed_levels: Vec<String>,
    },
    LevelStarted { level: String },
    ShowImage {
        url: String,
        organ: Option<String>,
        modality: Option<String>,
    },
    Countdown(u32),
    TimeRemaining(u32),
    ShowBoard { url: String, grid_size: usize },
    TileSelected(usize),
    SelectionCleared,
    BoardUpdated { url: String },
    PuzzleChecked { correct: bool },
    ShowQuiz(Vec<Question>),
    AnswerChosen { question: usize, option: usize },
    QuizGraded(QuizGrade),
    ScoreSaved {
        weighted_score: Option<f64>,
        total_score: Option<f64>,
    },
    TimedOut,
    Completed(String),
    /// Back to the registration screen.
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Request(Request),
    Timer(TimerCommand),
    Profile(ProfileUpdate),
    /// The reply to the foreground request in flight is no longer wanted.
    CancelRequest,
    ClearSession,
    Ui(UiUpdate),
}

pub struct GameSession {
    config: GameConfig,
    state: GameState,
    pending_name: Option<String>,
    player: Option<PlayerProfile>,
    countdown_secs: u32,
    /// Bumped for every image load; tags the background question fetch.
    generation: u64,
    puzzle_valid: bool,
    recovered_this_cycle: bool,
    submitting: bool,
    board: BoardController,
    quiz: QuizController,
}

impl GameSession {
    pub fn new(config: GameConfig) -> Self {
        Self {
            countdown_secs: config.countdown_secs,
            config,
            state: GameState::Idle,
            pending_name: None,
            player: None,
            generation: 0,
            puzzle_valid: false,
            recovered_this_cycle: false,
            submitting: false,
            board: BoardController::new(Bounds::square(IMAGE_SIDE_PX)),
            quiz: QuizController::default(),
        }
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn player(&self) -> Option<&PlayerProfile> {
        self.player.as_ref()
    }

    pub fn level(&self) -> Option<&str> {
        self.player.as_ref().map(|p| p.level.as_str())
    }

    pub fn is_puzzle_valid(&self) -> bool {
        self.puzzle_valid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn countdown_secs(&self) -> u32 {
        self.countdown_secs
    }

    pub fn board(&self) -> &BoardController {
        &self.board
    }

    pub fn quiz(&self) -> &QuizController {
        &self.quiz
    }

    pub fn handle(&mut self, event: Event) -> Result<Vec<Effect>, TransitionError> {
        match event {
            Event::SubmitName(name) => self.on_submit_name(name),
            Event::Click(pointer) => {
                self.require_interactive("select a tile")?;
                let outcome = self.board.click(pointer);
                Ok(self.on_click_outcome(outcome))
            }
            Event::SelectCell(index) => {
                self.require_interactive("select a tile")?;
                let outcome = self.board.select_cell(index);
                Ok(self.on_click_outcome(outcome))
            }
            Event::Validate => self.on_validate(),
            Event::ChooseAnswer { question, option } => self.on_choose_answer(question, option),
            Event::SubmitAnswers => self.on_submit_answers(),
            Event::NextLevel => match self.state {
                GameState::QuizGraded => {
                    self.transition(GameState::Advancing);
                    Ok(vec![Effect::Request(Request::NextLevel)])
                }
                state => Err(rejected(state, "advance to the next level")),
            },
            Event::RestartLevel => self.on_restart(),
            Event::NewGame => Ok(self.on_new_game()),
            Event::CountdownTick(remaining) => Ok(self.on_countdown_tick(remaining)),
            Event::TimeoutTick(remaining) => Ok(self.on_timeout_tick(remaining)),
            Event::Registered(reply) => self.on_registered(reply),
            Event::ImageLoaded(reply) => self.on_image(reply),
            Event::QuestionsLoaded { generation, reply } => {
                Ok(self.on_questions(generation, reply))
            }
            Event::Shuffled(reply) => self.on_shuffled(reply),
            Event::Swapped(reply) => Ok(self.on_swapped(reply)),
            Event::Validated(reply) => self.on_validated(reply),
            Event::AnswersChecked(reply) => self.on_answers_checked(reply),
            Event::ScoreSaved(reply) => Ok(on_score_saved(reply)),
            Event::LevelAdvanced(reply) => self.on_level_advanced(reply),
        }
    }

    fn transition(&mut self, next: GameState) {
        if self.state != next {
            debug!(target: "puzzle::session", from = %self.state, to = %next, "state transition");
            self.state = next;
        }
    }

    fn require_interactive(&self, action: &'static str) -> Result<(), TransitionError> {
        match self.state {
            GameState::Playing(PlayPhase::Interactive) => Ok(()),
            state => Err(rejected(state, action)),
        }
    }

    fn on_submit_name(&mut self, name: String) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Idle {
            return Err(rejected(self.state, "register"));
        }
        match validate_username(&name) {
            Ok(username) => {
                self.pending_name = Some(username.clone());
                self.transition(GameState::Registering);
                Ok(vec![Effect::Request(Request::Register { username })])
            }
            Err(err) => Ok(vec![ui(UiUpdate::InlineError(err.to_string()))]),
        }
    }

    fn on_registered(
        &mut self,
        reply: Fetched<RegisterReply>,
    ) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Registering {
            return Err(rejected(self.state, "accept a registration reply"));
        }
        let submitted = self.pending_name.take().unwrap_or_default();
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.transition(GameState::Idle);
                return Ok(vec![ui(UiUpdate::Alert(format!(
                    "Registration failed: {err}. Please try again."
                )))]);
            }
        };
        if let Some(error) = reply.error {
            self.transition(GameState::Idle);
            return Ok(vec![ui(UiUpdate::InlineError(error))]);
        }

        let username = reply.username.unwrap_or(submitted);
        let level = reply
            .next_level
            .unwrap_or_else(|| self.config.default_level.clone());
        self.countdown_secs = reply.countdown_time.unwrap_or(self.config.countdown_secs);
        let profile = PlayerProfile::new(username.clone(), reply.player_id, level);
        info!(
            target: "puzzle::session",
            username = %profile.username,
            level = %profile.level,
            returning = reply.is_returning,
            "player registered"
        );
        self.player = Some(profile.clone());

        let mut effects = vec![
            Effect::Profile(ProfileUpdate::Save(profile)),
            ui(UiUpdate::Welcome {
                username,
                returning: reply.is_returning,
                total_score: reply.total_score,
                completed_levels: reply.completed_levels,
            }),
        ];
        effects.extend(self.start_level_cycle());
        Ok(effects)
    }

    fn start_level_cycle(&mut self) -> Vec<Effect> {
        self.recovered_this_cycle = false;
        self.submitting = false;
        let level = self.level().unwrap_or_default().to_string();
        info!(target: "puzzle::session", level = %level, "starting level cycle");
        let mut effects = vec![
            Effect::Timer(TimerCommand::Stop(TimerKind::Countdown)),
            Effect::Timer(TimerCommand::Start {
                kind: TimerKind::LevelTimeout,
                seconds: self.config.level_timeout_secs,
            }),
            ui(UiUpdate::LevelStarted { level }),
        ];
        effects.extend(self.load_image());
        effects
    }

    fn load_image(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.puzzle_valid = false;
        self.board.reset();
        self.quiz.reset();
        self.transition(GameState::Playing(PlayPhase::ImageLoading));
        vec![Effect::Request(Request::Image)]
    }

    fn stall(&mut self, message: String) -> Vec<Effect> {
        warn!(target: "puzzle::session", state = %self.state, %message, "level stalled");
        self.transition(GameState::Playing(PlayPhase::Stalled));
        vec![ui(UiUpdate::Alert(format!(
            "{message} Restart the level to try again."
        )))]
    }

    fn complete(&mut self, message: String) -> Vec<Effect> {
        info!(target: "puzzle::session", "game completed");
        self.board.reset();
        self.transition(GameState::Completed);
        vec![
            Effect::Timer(TimerCommand::StopAll),
            ui(UiUpdate::Completed(message)),
        ]
    }

    fn on_image(&mut self, reply: Fetched<ImageReply>) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Playing(PlayPhase::ImageLoading) {
            return Err(rejected(self.state, "accept an image"));
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => return Ok(self.stall(format!("Failed to load the image: {err}."))),
        };
        if let Some(error) = reply.error {
            if error.contains(EXHAUSTED_MARKER) {
                return Ok(self.complete(error));
            }
            return Ok(self.stall(format!("Failed to load the image: {error}.")));
        }
        let Some(url) = reply.image_url else {
            return Ok(self.stall("The server sent no image.".to_string()));
        };
        let metadata = reply.metadata.unwrap_or_default();
        self.transition(GameState::Playing(PlayPhase::CountdownRunning));
        Ok(vec![
            ui(UiUpdate::ShowImage {
                url,
                organ: metadata.organ,
                modality: metadata.modality,
            }),
            Effect::Request(Request::Questions {
                generation: self.generation,
            }),
            Effect::Timer(TimerCommand::Start {
                kind: TimerKind::Countdown,
                seconds: self.countdown_secs,
            }),
        ])
    }

    fn on_questions(&mut self, generation: u64, reply: Fetched<QuestionsReply>) -> Vec<Effect> {
        if generation != self.generation {
            debug!(
                target: "puzzle::session",
                generation,
                current = self.generation,
                "dropping questions for an earlier image"
            );
            return Vec::new();
        }
        match reply {
            Ok(QuestionsReply { error: Some(error), .. }) => {
                vec![ui(UiUpdate::Alert(format!("Failed to load questions: {error}")))]
            }
            Ok(QuestionsReply { questions, .. }) if questions.is_empty() => {
                warn!(target: "puzzle::quiz", generation, "server sent no questions for this image");
                vec![ui(UiUpdate::Alert(
                    "No questions are available for this image.".to_string(),
                ))]
            }
            Ok(QuestionsReply { questions, .. }) => {
                self.quiz.load(questions.clone());
                vec![ui(UiUpdate::ShowQuiz(questions))]
            }
            Err(err) => vec![ui(UiUpdate::Alert(format!("Failed to load questions: {err}")))],
        }
    }

    fn on_countdown_tick(&mut self, remaining: u32) -> Vec<Effect> {
        if self.state != GameState::Playing(PlayPhase::CountdownRunning) {
            return Vec::new();
        }
        if remaining > 0 {
            return vec![ui(UiUpdate::Countdown(remaining))];
        }
        self.transition(GameState::Playing(PlayPhase::Shuffling));
        vec![
            ui(UiUpdate::Countdown(0)),
            Effect::Timer(TimerCommand::Stop(TimerKind::Countdown)),
            Effect::Request(Request::Shuffle),
        ]
    }

    fn on_timeout_tick(&mut self, remaining: u32) -> Vec<Effect> {
        if !matches!(self.state, GameState::Playing(_)) {
            return Vec::new();
        }
        if remaining > 0 {
            return vec![ui(UiUpdate::TimeRemaining(remaining))];
        }
        info!(target: "puzzle::session", level = ?self.level(), "level timed out");
        self.board.reset();
        self.transition(GameState::TimedOut);
        vec![
            Effect::Timer(TimerCommand::StopAll),
            Effect::CancelRequest,
            ui(UiUpdate::TimeRemaining(0)),
            ui(UiUpdate::TimedOut),
        ]
    }

    fn on_shuffled(&mut self, reply: Fetched<ShuffleReply>) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Playing(PlayPhase::Shuffling) {
            return Err(rejected(self.state, "accept a shuffle"));
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => return Ok(self.stall(format!("Failed to shuffle the image: {err}."))),
        };
        if reply.session_expired {
            if self.recovered_this_cycle {
                return Ok(self.stall("The game session expired again.".to_string()));
            }
            info!(target: "puzzle::session", "session expired during shuffle; reloading image");
            self.recovered_this_cycle = true;
            let mut effects = vec![
                Effect::ClearSession,
                ui(UiUpdate::Notice(
                    "Session expired, loading a fresh image...".to_string(),
                )),
            ];
            effects.extend(self.load_image());
            return Ok(effects);
        }
        if let Some(error) = reply.error {
            return Ok(self.stall(format!("Failed to shuffle the image: {error}.")));
        }
        match (reply.shuffled_image_url, reply.grid_size) {
            (Some(url), Some(grid_size)) if grid_size > 0 => {
                self.board.enable(grid_size);
                self.transition(GameState::Playing(PlayPhase::Interactive));
                Ok(vec![ui(UiUpdate::ShowBoard { url, grid_size })])
            }
            _ => Ok(self.stall("The shuffle reply was incomplete.".to_string())),
        }
    }

    fn on_click_outcome(&mut self, outcome: ClickOutcome) -> Vec<Effect> {
        match outcome {
            ClickOutcome::Ignored => Vec::new(),
            ClickOutcome::Selected(index) => vec![ui(UiUpdate::TileSelected(index))],
            ClickOutcome::Deselected(_) => vec![ui(UiUpdate::SelectionCleared)],
            ClickOutcome::Swap(request) => {
                debug!(
                    target: "puzzle::board",
                    index1 = request.index1,
                    index2 = request.index2,
                    "requesting swap"
                );
                vec![Effect::Request(Request::Swap(request))]
            }
        }
    }

    fn on_swapped(&mut self, reply: Fetched<SwapReply>) -> Vec<Effect> {
        if self.board.finish_swap().is_none() {
            debug!(target: "puzzle::board", state = %self.state, "ignoring swap reply with no swap pending");
            return Vec::new();
        }
        let mut effects = vec![ui(UiUpdate::SelectionCleared)];
        match reply {
            Ok(SwapReply {
                updated_image_url: Some(url),
                error: None,
            }) => effects.push(ui(UiUpdate::BoardUpdated { url })),
            Ok(SwapReply { error, .. }) => effects.push(ui(UiUpdate::Alert(format!(
                "Swap failed: {}",
                error.unwrap_or_else(|| "no updated image".to_string())
            )))),
            Err(err) => effects.push(ui(UiUpdate::Alert(format!("Swap failed: {err}")))),
        }
        effects
    }

    fn on_validate(&mut self) -> Result<Vec<Effect>, TransitionError> {
        self.require_interactive("validate the puzzle")?;
        if self.board.pending().is_some() {
            return Err(rejected(self.state, "validate while a swap is in flight"));
        }
        self.transition(GameState::Playing(PlayPhase::Validating));
        Ok(vec![Effect::Request(Request::Validate)])
    }

    fn on_validated(
        &mut self,
        reply: Fetched<ValidateReply>,
    ) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Playing(PlayPhase::Validating) {
            return Err(rejected(self.state, "accept a validation result"));
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.puzzle_valid = false;
                self.transition(GameState::Playing(PlayPhase::Interactive));
                return Ok(vec![ui(UiUpdate::Alert(format!("Validation failed: {err}")))]);
            }
        };
        if let Some(error) = reply.error {
            self.puzzle_valid = false;
            self.transition(GameState::Playing(PlayPhase::Interactive));
            return Ok(vec![ui(UiUpdate::Alert(format!("Validation failed: {error}")))]);
        }
        if !reply.is_correct {
            self.puzzle_valid = false;
            self.transition(GameState::Playing(PlayPhase::Interactive));
            return Ok(vec![ui(UiUpdate::PuzzleChecked { correct: false })]);
        }

        self.puzzle_valid = true;
        self.transition(GameState::QuizActive);
        let mut effects = vec![
            Effect::Timer(TimerCommand::Stop(TimerKind::LevelTimeout)),
            ui(UiUpdate::PuzzleChecked { correct: true }),
        ];
        if self.quiz.is_loaded() {
            effects.push(ui(UiUpdate::ShowQuiz(self.quiz.questions().to_vec())));
        } else {
            effects.push(ui(UiUpdate::Notice(
                "Loading the questions for this image...".to_string(),
            )));
        }
        Ok(effects)
    }

    fn on_choose_answer(
        &mut self,
        question: usize,
        option: usize,
    ) -> Result<Vec<Effect>, TransitionError> {
        match self.state {
            GameState::Playing(phase) if phase != PlayPhase::Stalled => {}
            GameState::QuizActive | GameState::QuizGraded => {}
            state => return Err(rejected(state, "answer a question")),
        }
        match self.quiz.choose(question, option) {
            Ok(()) => Ok(vec![ui(UiUpdate::AnswerChosen { question, option })]),
            Err(err) => Ok(vec![ui(UiUpdate::InlineError(err.to_string()))]),
        }
    }

    fn on_submit_answers(&mut self) -> Result<Vec<Effect>, TransitionError> {
        match self.state {
            GameState::QuizActive if self.submitting => {
                Err(rejected(self.state, "submit answers twice"))
            }
            GameState::QuizActive | GameState::Playing(_) => {
                if !self.puzzle_valid {
                    return Ok(vec![ui(UiUpdate::InlineError(
                        "Please solve the puzzle before submitting your answers.".to_string(),
                    ))]);
                }
                match self.quiz.collect_answers() {
                    Ok(answers) => {
                        self.submitting = true;
                        Ok(vec![Effect::Request(Request::CheckAnswers(
                            CheckAnswersRequest { answers },
                        ))])
                    }
                    Err(err) => Ok(vec![ui(UiUpdate::InlineError(err.to_string()))]),
                }
            }
            state => Err(rejected(state, "submit answers")),
        }
    }

    fn on_answers_checked(
        &mut self,
        reply: Fetched<CheckAnswersReply>,
    ) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::QuizActive || !self.submitting {
            return Err(rejected(self.state, "accept graded answers"));
        }
        self.submitting = false;
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                return Ok(vec![ui(UiUpdate::Alert(format!(
                    "Could not check answers: {err}"
                )))])
            }
        };
        if let Some(error) = reply.error.as_ref() {
            return Ok(vec![ui(UiUpdate::Alert(format!(
                "Could not check answers: {error}"
            )))]);
        }

        let grade = self.quiz.apply_grade(&reply);
        if let Some(server_score) = reply.score.filter(|s| *s != grade.score) {
            warn!(
                target: "puzzle::quiz",
                server_score,
                counted = grade.score,
                "server score disagrees with graded details"
            );
        }
        self.transition(GameState::QuizGraded);
        let score = grade.score;
        let mut effects = vec![ui(UiUpdate::QuizGraded(grade))];
        match self.player.as_ref() {
            Some(PlayerProfile {
                player_id: Some(player_id),
                level,
                ..
            }) => effects.push(Effect::Request(Request::SaveScore(SaveScoreRequest {
                player_id: player_id.clone(),
                level: level.clone(),
                score,
            }))),
            _ => {
                warn!(target: "puzzle::quiz", "no player id; score not saved");
                effects.push(ui(UiUpdate::Notice(
                    "Score could not be saved for this player.".to_string(),
                )));
            }
        }
        Ok(effects)
    }

    fn on_level_advanced(
        &mut self,
        reply: Fetched<NextLevelReply>,
    ) -> Result<Vec<Effect>, TransitionError> {
        if self.state != GameState::Advancing {
            return Err(rejected(self.state, "accept the next level"));
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.transition(GameState::QuizGraded);
                return Ok(vec![ui(UiUpdate::Alert(format!(
                    "Could not load the next level: {err}"
                )))]);
            }
        };
        if let Some(error) = reply.error {
            self.transition(GameState::QuizGraded);
            return Ok(vec![ui(UiUpdate::Alert(format!(
                "Could not load the next level: {error}"
            )))]);
        }
        match reply.level {
            Some(level) => {
                let mut effects = Vec::new();
                if let Some(profile) = self.player.take() {
                    let profile = profile.with_level(level);
                    effects.push(Effect::Profile(ProfileUpdate::Save(profile.clone())));
                    self.player = Some(profile);
                }
                effects.extend(self.start_level_cycle());
                Ok(effects)
            }
            None => Ok(self.complete(COMPLETION_MESSAGE.to_string())),
        }
    }

    fn on_restart(&mut self) -> Result<Vec<Effect>, TransitionError> {
        match self.state {
            GameState::Playing(_) | GameState::TimedOut | GameState::QuizActive => {
                info!(target: "puzzle::session", from = %self.state, "restarting level");
                let mut effects = vec![
                    Effect::Timer(TimerCommand::StopAll),
                    Effect::CancelRequest,
                ];
                effects.extend(self.start_level_cycle());
                Ok(effects)
            }
            state => Err(rejected(state, "restart the level")),
        }
    }

    fn on_new_game(&mut self) -> Vec<Effect> {
        info!(target: "puzzle::session", from = %self.state, "starting a new game");
        self.player = None;
        self.pending_name = None;
        self.countdown_secs = self.config.countdown_secs;
        self.generation += 1;
        self.puzzle_valid = false;
        self.recovered_this_cycle = false;
        self.submitting = false;
        self.board.reset();
        self.quiz.reset();
        self.transition(GameState::Idle);
        vec![
            Effect::Timer(TimerCommand::StopAll),
            Effect::CancelRequest,
            Effect::ClearSession,
            Effect::Profile(ProfileUpdate::Clear),
            ui(UiUpdate::Reset),
        ]
    }
}

fn on_score_saved(reply: Fetched<SaveScoreReply>) -> Vec<Effect> {
    match reply {
        Ok(SaveScoreReply {
            error: Some(error), ..
        }) => vec![ui(UiUpdate::Alert(format!("Failed to save score: {error}")))],
        Ok(reply) => vec![ui(UiUpdate::ScoreSaved {
            weighted_score: reply.weighted_score,
            total_score: reply.total_score,
        })],
        Err(err) => vec![ui(UiUpdate::Alert(format!("Failed to save score: {err}")))],
    }
}

fn rejected(state: GameState, action: &'static str) -> TransitionError {
    TransitionError::Rejected { state, action }
}

fn ui(update: UiUpdate) -> Effect {
    Effect::Ui(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use puzzle_proto::{AnswerDetail, ImageMetadata};

    fn config() -> GameConfig {
        GameConfig {
            level_timeout_secs: 60,
            ..GameConfig::default()
        }
    }

    fn requests(effects: &[Effect]) -> Vec<Request> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Request(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn has_ui(effects: &[Effect], wanted: impl Fn(&UiUpdate) -> bool) -> bool {
        effects.iter().any(|effect| match effect {
            Effect::Ui(update) => wanted(update),
            _ => false,
        })
    }

    fn registered() -> RegisterReply {
        RegisterReply {
            player_id: Some("p-1".into()),
            username: Some("Alice".into()),
            next_level: Some("level_1".into()),
            countdown_time: Some(2),
            ..RegisterReply::default()
        }
    }

    fn image() -> ImageReply {
        ImageReply {
            image_url: Some("/static/images/level_1/heart.jpg".into()),
            metadata: Some(ImageMetadata {
                organ: Some("Heart".into()),
                modality: Some("MRI".into()),
            }),
            ..ImageReply::default()
        }
    }

    fn shuffled(grid_size: usize) -> ShuffleReply {
        ShuffleReply {
            shuffled_image_url: Some("/static/images/temp/shuffled.jpg".into()),
            grid_size: Some(grid_size),
            ..ShuffleReply::default()
        }
    }

    fn questions() -> QuestionsReply {
        QuestionsReply {
            questions: vec![
                Question {
                    question: "Which organ?".into(),
                    options: vec!["Heart".into(), "Lung".into()],
                },
                Question {
                    question: "Which modality?".into(),
                    options: vec!["CT".into(), "MRI".into()],
                },
            ],
            error: None,
        }
    }

    /// Drives a fresh session up to the interactive board.
    fn interactive_session() -> GameSession {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        let generation = session.generation();
        session
            .handle(Event::QuestionsLoaded {
                generation,
                reply: Ok(questions()),
            })
            .unwrap();
        session.handle(Event::CountdownTick(0)).unwrap();
        session.handle(Event::Shuffled(Ok(shuffled(4)))).unwrap();
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Interactive));
        session
    }

    fn solved_session() -> GameSession {
        let mut session = interactive_session();
        session.handle(Event::Validate).unwrap();
        session
            .handle(Event::Validated(Ok(ValidateReply {
                is_correct: true,
                error: None,
            })))
            .unwrap();
        session
    }

    #[test]
    fn username_rules() {
        assert_eq!(validate_username("  Alice  "), Ok("Alice".to_string()));
        assert_eq!(validate_username("Ann Lee"), Ok("Ann Lee".to_string()));
        assert_eq!(validate_username("Al"), Err(NameError::TooShort));
        assert_eq!(validate_username("   ab  "), Err(NameError::TooShort));
        assert_eq!(validate_username("Alice9"), Err(NameError::InvalidCharacters));
        assert_eq!(validate_username("Zoë"), Err(NameError::InvalidCharacters));
    }

    #[test]
    fn invalid_name_makes_no_request() {
        let mut session = GameSession::new(config());
        for name in ["", "Jo", "R2D2", "alice_b"] {
            let effects = session.handle(Event::SubmitName(name.into())).unwrap();
            assert!(requests(&effects).is_empty(), "{name} should not be sent");
            assert!(has_ui(&effects, |u| matches!(u, UiUpdate::InlineError(_))));
            assert_eq!(session.state(), GameState::Idle);
        }
    }

    #[test]
    fn valid_name_registers() {
        let mut session = GameSession::new(config());
        let effects = session.handle(Event::SubmitName(" Alice ".into())).unwrap();
        assert_eq!(
            requests(&effects),
            vec![Request::Register {
                username: "Alice".into()
            }]
        );
        assert_eq!(session.state(), GameState::Registering);
    }

    #[test]
    fn registration_error_returns_to_idle() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        let effects = session
            .handle(Event::Registered(Ok(RegisterReply {
                error: Some("Username already exists".into()),
                ..RegisterReply::default()
            })))
            .unwrap();
        assert_eq!(session.state(), GameState::Idle);
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::InlineError(m) if m == "Username already exists")));
    }

    #[test]
    fn registration_applies_server_values_and_defaults() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        let effects = session
            .handle(Event::Registered(Ok(RegisterReply {
                player_id: Some("p-9".into()),
                ..RegisterReply::default()
            })))
            .unwrap();
        assert_eq!(session.level(), Some("level_1"));
        assert_eq!(session.countdown_secs(), 3);
        assert_eq!(session.state(), GameState::Playing(PlayPhase::ImageLoading));
        assert_eq!(requests(&effects), vec![Request::Image]);
        assert!(effects.contains(&Effect::Timer(TimerCommand::Start {
            kind: TimerKind::LevelTimeout,
            seconds: 60
        })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Profile(ProfileUpdate::Save(p)) if p.username == "Alice" && p.player_id.as_deref() == Some("p-9")
        )));
    }

    #[test]
    fn image_starts_countdown_and_background_questions() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        let effects = session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        assert_eq!(
            session.state(),
            GameState::Playing(PlayPhase::CountdownRunning)
        );
        assert_eq!(
            requests(&effects),
            vec![Request::Questions {
                generation: session.generation()
            }]
        );
        assert!(effects.contains(&Effect::Timer(TimerCommand::Start {
            kind: TimerKind::Countdown,
            seconds: 2
        })));

        let effects = session.handle(Event::CountdownTick(1)).unwrap();
        assert_eq!(effects, vec![Effect::Ui(UiUpdate::Countdown(1))]);
        let effects = session.handle(Event::CountdownTick(0)).unwrap();
        assert_eq!(requests(&effects), vec![Request::Shuffle]);
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Shuffling));
    }

    #[test]
    fn exhausted_images_complete_the_game() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        let effects = session
            .handle(Event::ImageLoaded(Ok(ImageReply {
                error: Some("No images available in the current level".into()),
                ..ImageReply::default()
            })))
            .unwrap();
        assert_eq!(session.state(), GameState::Completed);
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::Completed(_))));
    }

    #[test]
    fn image_failure_stalls_until_restart() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        let effects = session
            .handle(Event::ImageLoaded(Err("connection refused".into())))
            .unwrap();
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Stalled));
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::Alert(_))));

        let effects = session.handle(Event::RestartLevel).unwrap();
        assert_eq!(requests(&effects), vec![Request::Image]);
    }

    #[test]
    fn swapping_before_shuffle_is_rejected() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        assert!(matches!(
            session.handle(Event::SelectCell(0)),
            Err(TransitionError::Rejected { .. })
        ));
        assert!(session.handle(Event::Validate).is_err());
    }

    #[test]
    fn two_cells_issue_one_swap_and_clear_selection() {
        let mut session = interactive_session();
        let effects = session
            .handle(Event::Click(PointerEvent { x: 10.0, y: 10.0 }))
            .unwrap();
        assert_eq!(effects, vec![Effect::Ui(UiUpdate::TileSelected(0))]);
        let effects = session
            .handle(Event::Click(PointerEvent { x: 140.0, y: 10.0 }))
            .unwrap();
        assert_eq!(
            requests(&effects),
            vec![Request::Swap(SwapRequest {
                index1: 0,
                index2: 1
            })]
        );
        let effects = session
            .handle(Event::Swapped(Ok(SwapReply {
                updated_image_url: Some("/static/images/temp/updated.jpg".into()),
                error: None,
            })))
            .unwrap();
        assert!(has_ui(&effects, |u| *u == UiUpdate::SelectionCleared));
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::BoardUpdated { .. })));
        assert_eq!(session.board().selected(), None);
    }

    #[test]
    fn same_cell_twice_sends_nothing() {
        let mut session = interactive_session();
        session.handle(Event::SelectCell(3)).unwrap();
        let effects = session.handle(Event::SelectCell(3)).unwrap();
        assert_eq!(effects, vec![Effect::Ui(UiUpdate::SelectionCleared)]);
        assert_eq!(session.board().selected(), None);
    }

    #[test]
    fn failed_swap_still_clears_selection() {
        let mut session = interactive_session();
        session.handle(Event::SelectCell(0)).unwrap();
        session.handle(Event::SelectCell(5)).unwrap();
        let effects = session
            .handle(Event::Swapped(Err("timeout".into())))
            .unwrap();
        assert!(has_ui(&effects, |u| *u == UiUpdate::SelectionCleared));
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::Alert(_))));
        assert_eq!(session.board().pending(), None);
    }

    #[test]
    fn failed_validation_resets_flag_and_stays_interactive() {
        let mut session = interactive_session();
        session.handle(Event::Validate).unwrap();
        let effects = session
            .handle(Event::Validated(Ok(ValidateReply {
                is_correct: false,
                error: None,
            })))
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Ui(UiUpdate::PuzzleChecked { correct: false })]
        );
        assert!(!session.is_puzzle_valid());
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Interactive));
    }

    #[test]
    fn submit_before_solving_is_rejected_client_side() {
        let mut session = interactive_session();
        session
            .handle(Event::ChooseAnswer {
                question: 0,
                option: 0,
            })
            .unwrap();
        session
            .handle(Event::ChooseAnswer {
                question: 1,
                option: 1,
            })
            .unwrap();
        let effects = session.handle(Event::SubmitAnswers).unwrap();
        assert!(requests(&effects).is_empty());
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::InlineError(_))));
    }

    #[test]
    fn incomplete_quiz_is_rejected_client_side() {
        let mut session = solved_session();
        assert!(session.is_puzzle_valid());
        session
            .handle(Event::ChooseAnswer {
                question: 0,
                option: 0,
            })
            .unwrap();
        let effects = session.handle(Event::SubmitAnswers).unwrap();
        assert!(requests(&effects).is_empty());
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::InlineError(_))));
        assert_eq!(session.state(), GameState::QuizActive);
    }

    #[test]
    fn graded_quiz_saves_score_and_disables_submit() {
        let mut session = solved_session();
        session
            .handle(Event::ChooseAnswer {
                question: 0,
                option: 0,
            })
            .unwrap();
        session
            .handle(Event::ChooseAnswer {
                question: 1,
                option: 0,
            })
            .unwrap();
        let effects = session.handle(Event::SubmitAnswers).unwrap();
        assert_eq!(requests(&effects).len(), 1);

        let effects = session
            .handle(Event::AnswersChecked(Ok(CheckAnswersReply {
                score: Some(1),
                total_questions: Some(2),
                details: vec![
                    AnswerDetail {
                        is_correct: true,
                        correct_answer: "Heart".into(),
                        question: None,
                        player_answer: None,
                    },
                    AnswerDetail {
                        is_correct: false,
                        correct_answer: "MRI".into(),
                        question: None,
                        player_answer: None,
                    },
                ],
                error: None,
            })))
            .unwrap();
        assert_eq!(session.state(), GameState::QuizGraded);
        assert_eq!(
            requests(&effects),
            vec![Request::SaveScore(SaveScoreRequest {
                player_id: "p-1".into(),
                level: "level_1".into(),
                score: 1
            })]
        );
        assert!(session.handle(Event::SubmitAnswers).is_err());
    }

    #[test]
    fn questions_from_an_earlier_image_are_dropped() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        let stale = session.generation();
        session.handle(Event::RestartLevel).unwrap();
        let effects = session
            .handle(Event::QuestionsLoaded {
                generation: stale,
                reply: Ok(questions()),
            })
            .unwrap();
        assert!(effects.is_empty());
        assert!(!session.quiz().is_loaded());
    }

    #[test]
    fn timeout_blocks_board_until_restart() {
        let mut session = interactive_session();
        let effects = session.handle(Event::TimeoutTick(0)).unwrap();
        assert_eq!(session.state(), GameState::TimedOut);
        assert!(effects.contains(&Effect::Timer(TimerCommand::StopAll)));
        assert!(effects.contains(&Effect::CancelRequest));
        assert!(has_ui(&effects, |u| *u == UiUpdate::TimedOut));

        assert!(session.handle(Event::SelectCell(0)).is_err());
        assert!(session.handle(Event::Validate).is_err());

        let effects = session.handle(Event::RestartLevel).unwrap();
        assert_eq!(requests(&effects), vec![Request::Image]);
        assert_eq!(session.state(), GameState::Playing(PlayPhase::ImageLoading));
    }

    #[test]
    fn timeout_while_validating_beats_a_late_reply() {
        let mut session = interactive_session();
        session.handle(Event::SelectCell(0)).unwrap();
        session.handle(Event::SelectCell(1)).unwrap();
        session
            .handle(Event::Swapped(Ok(SwapReply {
                updated_image_url: Some("/static/images/temp/swapped.jpg".into()),
                error: None,
            })))
            .unwrap();
        session.handle(Event::Validate).unwrap();
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Validating));

        let effects = session.handle(Event::TimeoutTick(0)).unwrap();
        assert_eq!(session.state(), GameState::TimedOut);
        assert!(effects.contains(&Effect::CancelRequest));

        let late = session.handle(Event::Validated(Ok(ValidateReply {
            is_correct: true,
            error: None,
        })));
        assert!(matches!(late, Err(TransitionError::Rejected { .. })));
        assert_eq!(session.state(), GameState::TimedOut);
        assert!(!session.is_puzzle_valid());
    }

    #[test]
    fn empty_question_set_is_never_submitted() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        let generation = session.generation();
        let effects = session
            .handle(Event::QuestionsLoaded {
                generation,
                reply: Ok(QuestionsReply::default()),
            })
            .unwrap();
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::Alert(_))));
        assert!(!session.quiz().is_loaded());

        session.handle(Event::CountdownTick(0)).unwrap();
        session.handle(Event::Shuffled(Ok(shuffled(3)))).unwrap();
        session.handle(Event::Validate).unwrap();
        session
            .handle(Event::Validated(Ok(ValidateReply {
                is_correct: true,
                error: None,
            })))
            .unwrap();
        let effects = session.handle(Event::SubmitAnswers).unwrap();
        assert!(requests(&effects).is_empty());
        assert!(has_ui(&effects, |u| matches!(u, UiUpdate::InlineError(_))));
        assert_eq!(session.state(), GameState::QuizActive);
    }

    #[test]
    fn only_restart_and_new_game_interrupt() {
        assert!(Event::Validate.is_player_action());
        assert!(!Event::Validate.interrupts());
        assert!(Event::RestartLevel.interrupts());
        assert!(Event::NewGame.interrupts());
        assert!(!Event::TimeoutTick(0).is_player_action());
        assert!(!Event::Validated(Err("down".into())).is_player_action());
    }

    #[test]
    fn timeout_does_not_apply_during_quiz() {
        let mut session = solved_session();
        let effects = session.handle(Event::TimeoutTick(0)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(session.state(), GameState::QuizActive);
    }

    #[test]
    fn expired_session_recovers_once() {
        let mut session = GameSession::new(config());
        session.handle(Event::SubmitName("Alice".into())).unwrap();
        session.handle(Event::Registered(Ok(registered()))).unwrap();
        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        session.handle(Event::CountdownTick(0)).unwrap();

        let expired = ShuffleReply {
            error: Some("Session expired or invalid.".into()),
            session_expired: true,
            ..ShuffleReply::default()
        };
        let effects = session.handle(Event::Shuffled(Ok(expired.clone()))).unwrap();
        assert!(effects.contains(&Effect::ClearSession));
        assert_eq!(requests(&effects), vec![Request::Image]);

        session.handle(Event::ImageLoaded(Ok(image()))).unwrap();
        session.handle(Event::CountdownTick(0)).unwrap();
        let effects = session.handle(Event::Shuffled(Ok(expired))).unwrap();
        assert!(!effects.contains(&Effect::ClearSession));
        assert_eq!(session.state(), GameState::Playing(PlayPhase::Stalled));
    }

    #[test]
    fn next_level_restarts_cycle_or_completes() {
        let mut session = solved_session();
        for (q, o) in [(0, 0), (1, 1)] {
            session
                .handle(Event::ChooseAnswer {
                    question: q,
                    option: o,
                })
                .unwrap();
        }
        session.handle(Event::SubmitAnswers).unwrap();
        session
            .handle(Event::AnswersChecked(Ok(CheckAnswersReply::default())))
            .unwrap();
        session.handle(Event::NextLevel).unwrap();
        let effects = session
            .handle(Event::LevelAdvanced(Ok(NextLevelReply {
                level: Some("level_2".into()),
                ..NextLevelReply::default()
            })))
            .unwrap();
        assert_eq!(session.level(), Some("level_2"));
        assert!(!session.is_puzzle_valid());
        assert!(!session.quiz().is_submitted());
        assert_eq!(requests(&effects), vec![Request::Image]);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Profile(ProfileUpdate::Save(p)) if p.level == "level_2"
        )));
    }

    #[test]
    fn new_game_clears_everything() {
        let mut session = interactive_session();
        let effects = session.handle(Event::NewGame).unwrap();
        assert_eq!(session.state(), GameState::Idle);
        assert!(session.player().is_none());
        assert!(effects.contains(&Effect::ClearSession));
        assert!(effects.contains(&Effect::CancelRequest));
        assert!(effects.contains(&Effect::Profile(ProfileUpdate::Clear)));
    }
}
