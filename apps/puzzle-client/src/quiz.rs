use puzzle_proto::{Answer, AnswerDetail, CheckAnswersReply, Question};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuizError {
    #[error("no questions loaded for this image yet")]
    NotLoaded,
    #[error("answers were already submitted")]
    AlreadySubmitted,
    #[error("please answer all questions before submitting ({missing} unanswered)")]
    Incomplete { missing: usize },
    #[error("question {question} does not exist")]
    UnknownQuestion { question: usize },
    #[error("question {question} has no option {option}")]
    UnknownOption { question: usize, option: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Correct,
    Incorrect { correct_answer: String },
    /// The grade did not cover this question.
    Ungraded,
}

/// Graded outcome of a submitted question set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizGrade {
    /// Correct answers counted from the per-question details.
    pub score: u32,
    pub total: u32,
    pub feedback: Vec<Feedback>,
}

/// Question set for the current image plus the player's choices.
#[derive(Debug, Clone, Default)]
pub struct QuizController {
    questions: Vec<Question>,
    choices: Vec<Option<usize>>,
    loaded: bool,
    submitted: bool,
}

impl QuizController {
    pub fn load(&mut self, questions: Vec<Question>) {
        self.choices = vec![None; questions.len()];
        self.questions = questions;
        self.loaded = true;
        self.submitted = false;
    }

    /// Discards the set; called at the start of every level cycle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn choice(&self, question: usize) -> Option<usize> {
        self.choices.get(question).copied().flatten()
    }

    pub fn choose(&mut self, question: usize, option: usize) -> Result<(), QuizError> {
        if !self.loaded {
            return Err(QuizError::NotLoaded);
        }
        if self.submitted {
            return Err(QuizError::AlreadySubmitted);
        }
        let entry = self
            .questions
            .get(question)
            .ok_or(QuizError::UnknownQuestion { question })?;
        if option >= entry.options.len() {
            return Err(QuizError::UnknownOption { question, option });
        }
        self.choices[question] = Some(option);
        Ok(())
    }

    /// Answers in question order, or why they cannot be submitted yet.
    pub fn collect_answers(&self) -> Result<Vec<Answer>, QuizError> {
        // an empty set would only record a zero score
        if !self.loaded || self.questions.is_empty() {
            return Err(QuizError::NotLoaded);
        }
        if self.submitted {
            return Err(QuizError::AlreadySubmitted);
        }
        let missing = self.choices.iter().filter(|c| c.is_none()).count();
        if missing > 0 {
            return Err(QuizError::Incomplete { missing });
        }
        Ok(self
            .questions
            .iter()
            .zip(&self.choices)
            .enumerate()
            .filter_map(|(index, (question, choice))| {
                let option = question.options.get((*choice)?)?;
                Some(Answer {
                    index,
                    answer: option.clone(),
                })
            })
            .collect())
    }

    /// Applies a graded reply and locks the set against resubmission.
    pub fn apply_grade(&mut self, reply: &CheckAnswersReply) -> QuizGrade {
        self.submitted = true;
        let feedback = (0..self.questions.len())
            .map(|index| match reply.details.get(index) {
                Some(AnswerDetail {
                    is_correct: true, ..
                }) => Feedback::Correct,
                Some(detail) => Feedback::Incorrect {
                    correct_answer: detail.correct_answer.clone(),
                },
                None => Feedback::Ungraded,
            })
            .collect();
        QuizGrade {
            score: reply.correct_count(),
            total: reply
                .total_questions
                .unwrap_or(self.questions.len() as u32),
            feedback,
        }
    }
}
