//! Command dispatch.
//!
//! Transports translate their messages into `Command`s and push them into a
//! channel. One worker drains the channel and looks each command up in an
//! explicit table, so long-running commands never overlap.

use crossbeam_channel::Receiver;
use std::collections::HashMap;

use crate::enroll::EnrollmentOutcome;
use crate::intercom::{Intercom, RecognitionOutcome};
use crate::matching::MatchDecision;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    LearnNewFace,
    RecognizeFace,
    Unlock,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    LearnNewFace { name: Option<String> },
    RecognizeFace,
    Unlock,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::LearnNewFace { .. } => CommandKind::LearnNewFace,
            Command::RecognizeFace => CommandKind::RecognizeFace,
            Command::Unlock => CommandKind::Unlock,
        }
    }
}

type Handler<T> = Box<dyn Fn(&T, &Command) + Send + Sync>;

pub struct CommandDispatcher<T> {
    handlers: HashMap<CommandKind, Handler<T>>,
}

impl<T> CommandDispatcher<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install the handler for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: CommandKind, handler: F)
    where
        F: Fn(&T, &Command) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Run the handler for `command`. Returns false when none is registered.
    pub fn dispatch(&self, target: &T, command: &Command) -> bool {
        match self.handlers.get(&command.kind()) {
            Some(handler) => {
                handler(target, command);
                true
            }
            None => {
                log::warn!("no handler registered for {:?}", command.kind());
                false
            }
        }
    }

    /// Drain `commands` until every sender is dropped.
    pub fn run(&self, target: &T, commands: Receiver<Command>) {
        for command in commands.iter() {
            log::info!("dispatching {:?}", command.kind());
            self.dispatch(target, &command);
        }
        log::info!("command channel closed");
    }
}

impl<T> Default for CommandDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher<Intercom> {
    /// The standard table: enrollment, recognition and manual unlock.
    pub fn for_intercom() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(CommandKind::LearnNewFace, |intercom, command| {
            let name = match command {
                Command::LearnNewFace { name } => name.clone(),
                _ => None,
            };
            match intercom.learn_new_face(name) {
                EnrollmentOutcome::Enrolled {
                    name,
                    embeddings,
                    persisted,
                } => log::info!(
                    "enrollment complete: {} ({} embeddings, persisted: {})",
                    name,
                    embeddings,
                    persisted
                ),
                EnrollmentOutcome::Inconclusive { name } => {
                    log::warn!("enrollment of {} inconclusive", name)
                }
                EnrollmentOutcome::StreamUnavailable => {
                    log::error!("enrollment aborted: stream unavailable")
                }
                EnrollmentOutcome::RecognitionDisabled => {
                    log::error!("enrollment refused: face recognition is not configured")
                }
            }
        });
        dispatcher.register(CommandKind::RecognizeFace, |intercom, _| {
            match intercom.capture_face() {
                RecognitionOutcome::Finished {
                    decision: Some(MatchDecision::Recognized { name, .. }),
                    ..
                } => log::info!("recognition complete: {}", name),
                RecognitionOutcome::Finished {
                    frames_examined, ..
                } => log::info!("recognition complete: no match in {} frames", frames_examined),
                RecognitionOutcome::StreamUnavailable => {
                    log::error!("recognition aborted: stream unavailable")
                }
                RecognitionOutcome::RecognitionDisabled => {
                    log::error!("recognition refused: face recognition is not configured")
                }
            }
        });
        dispatcher.register(CommandKind::Unlock, |intercom, _| intercom.unlock());
        dispatcher
    }
}
