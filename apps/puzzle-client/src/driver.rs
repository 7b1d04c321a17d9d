//! Async driver: feeds player actions, timer ticks and server replies into
//! [`GameSession`] and carries out the effects it returns.
//!
//! At most one foreground request is in flight. It runs on its own task and
//! its reply comes back tagged with a request number, so timer ticks are
//! handled while it is pending. Player actions that arrive meanwhile are
//! held and replayed once the reply settles; a restart or a new game goes
//! through at once. The question fetch is the only background request; its
//! reply is tagged with the image generation it was issued for.

use std::collections::VecDeque;
use std::sync::Arc;

use puzzle_sdk::{GameClient, Reply};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::GameConfig;
use crate::profile::ProfileStore;
use crate::session::{Effect, Event, Fetched, GameSession, ProfileUpdate, Request, UiUpdate};
use crate::timer::{TimerEvent, TimerKind, TimerService};

/// Receives every player-visible change.
pub trait GameView: Send {
    fn render(&mut self, update: &UiUpdate);
}

struct InFlight {
    id: u64,
    path: &'static str,
    task: JoinHandle<()>,
}

pub struct GameDriver<V> {
    session: GameSession,
    client: GameClient,
    profiles: Arc<dyn ProfileStore>,
    timers: TimerService,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    replies_tx: mpsc::UnboundedSender<(u64, Event)>,
    replies_rx: mpsc::UnboundedReceiver<(u64, Event)>,
    background_tx: mpsc::UnboundedSender<Event>,
    background_rx: mpsc::UnboundedReceiver<Event>,
    in_flight: Option<InFlight>,
    next_request: u64,
    held: VecDeque<Event>,
    view: V,
}

impl<V: GameView> GameDriver<V> {
    pub fn new(
        config: GameConfig,
        client: GameClient,
        profiles: Arc<dyn ProfileStore>,
        view: V,
    ) -> Self {
        let (timers, timer_rx) = TimerService::new(config.tick);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        Self {
            session: GameSession::new(config),
            client,
            profiles,
            timers,
            timer_rx,
            replies_tx,
            replies_rx,
            background_tx,
            background_rx,
            in_flight: None,
            next_request: 0,
            held: VecDeque::new(),
            view,
        }
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    /// Runs until the action channel closes.
    pub async fn run(&mut self, mut actions: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(event) => self.act(event).await,
                    None => break,
                },
                Some(tick) = self.timer_rx.recv() => {
                    if !self.timers.accepts(&tick) {
                        trace!(target: "puzzle::timer", ?tick, "dropping tick from a stopped timer");
                        continue;
                    }
                    let event = match tick.kind {
                        TimerKind::Countdown => Event::CountdownTick(tick.remaining),
                        TimerKind::LevelTimeout => Event::TimeoutTick(tick.remaining),
                    };
                    self.dispatch(event).await;
                }
                Some((id, event)) = self.replies_rx.recv() => self.settle(id, event).await,
                Some(event) = self.background_rx.recv() => self.dispatch(event).await,
            }
            self.release_held().await;
        }
        self.cancel_request();
        self.timers.stop_all();
        debug!(target: "puzzle::driver", state = %self.session.state(), "driver stopped");
    }

    async fn act(&mut self, event: Event) {
        if self.in_flight.is_some() && !event.interrupts() {
            trace!(target: "puzzle::driver", ?event, "holding action until the request in flight settles");
            self.held.push_back(event);
            return;
        }
        self.dispatch(event).await;
    }

    async fn settle(&mut self, id: u64, event: Event) {
        if self.in_flight.as_ref().map(|request| request.id) != Some(id) {
            debug!(target: "puzzle::driver", request = id, "dropping reply to a cancelled request");
            return;
        }
        self.in_flight = None;
        self.dispatch(event).await;
    }

    async fn release_held(&mut self) {
        while self.in_flight.is_none() {
            let Some(event) = self.held.pop_front() else {
                break;
            };
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let from_player = event.is_player_action();
        let effects = match self.session.handle(event) {
            Ok(effects) => effects,
            Err(err) if from_player => {
                debug!(target: "puzzle::driver", error = %err, "action rejected");
                self.view.render(&UiUpdate::Notice(err.to_string()));
                return;
            }
            Err(err) => {
                debug!(target: "puzzle::driver", error = %err, "dropping stale reply");
                return;
            }
        };
        for effect in effects {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Request(request) => self.perform(request),
            Effect::CancelRequest => {
                self.cancel_request();
                if !self.held.is_empty() {
                    debug!(target: "puzzle::driver", dropped = self.held.len(), "discarding held actions");
                    self.held.clear();
                }
            }
            Effect::Timer(command) => self.timers.apply(command),
            Effect::Profile(update) => {
                let result = match &update {
                    ProfileUpdate::Save(profile) => self.profiles.save(profile).await,
                    ProfileUpdate::Clear => self.profiles.clear().await,
                };
                if let Err(err) = result {
                    warn!(target: "puzzle::profile", error = %err, "profile update failed");
                    self.view
                        .render(&UiUpdate::Notice(format!("Profile not saved: {err}")));
                }
            }
            Effect::ClearSession => self.client.clear_session(),
            Effect::Ui(update) => self.view.render(&update),
        }
    }

    fn perform(&mut self, request: Request) {
        let client = self.client.clone();
        if let Request::Questions { .. } = request {
            let tx = self.background_tx.clone();
            tokio::spawn(async move {
                // the receiver only goes away with the driver
                let _ = tx.send(call(client, request).await);
            });
            return;
        }

        self.cancel_request();
        self.next_request += 1;
        let id = self.next_request;
        let path = endpoint(&request);
        let tx = self.replies_tx.clone();
        let task = tokio::spawn(async move {
            let _ = tx.send((id, call(client, request).await));
        });
        trace!(target: "puzzle::driver", request = id, path, "request started");
        self.in_flight = Some(InFlight { id, path, task });
    }

    fn cancel_request(&mut self) {
        if let Some(request) = self.in_flight.take() {
            debug!(target: "puzzle::driver", request = request.id, path = request.path, "cancelling request in flight");
            request.task.abort();
        }
    }
}

fn endpoint(request: &Request) -> &'static str {
    match request {
        Request::Register { .. } => "/register",
        Request::Image => "/image",
        Request::Questions { .. } => "/questions",
        Request::Shuffle => "/shuffle",
        Request::Swap(_) => "/swap",
        Request::Validate => "/validate",
        Request::CheckAnswers(_) => "/check_answers",
        Request::SaveScore(_) => "/save_score",
        Request::NextLevel => "/next_level",
    }
}

async fn call(client: GameClient, request: Request) -> Event {
    let path = endpoint(&request);
    match request {
        Request::Register { username } => {
            Event::Registered(fetched(path, client.register(&username).await))
        }
        Request::Image => Event::ImageLoaded(fetched(path, client.image().await)),
        Request::Questions { generation } => Event::QuestionsLoaded {
            generation,
            reply: fetched(path, client.questions().await),
        },
        Request::Shuffle => Event::Shuffled(fetched(path, client.shuffle().await)),
        Request::Swap(swap) => Event::Swapped(fetched(path, client.swap(swap).await)),
        Request::Validate => Event::Validated(fetched(path, client.validate().await)),
        Request::CheckAnswers(answers) => {
            Event::AnswersChecked(fetched(path, client.check_answers(&answers).await))
        }
        Request::SaveScore(score) => {
            Event::ScoreSaved(fetched(path, client.save_score(&score).await))
        }
        Request::NextLevel => Event::LevelAdvanced(fetched(path, client.next_level().await)),
    }
}

fn fetched<T>(path: &'static str, reply: Reply<T>) -> Fetched<T> {
    match reply {
        Ok(response) => {
            if !response.ok {
                debug!(target: "puzzle::driver", path, status = %response.status, "server answered with an error status");
            }
            Ok(response.body)
        }
        Err(err) => {
            warn!(target: "puzzle::driver", path, error = %err, "request failed");
            Err(err.to_string())
        }
    }
}
