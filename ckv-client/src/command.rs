//! # Command Lifecycle
//!
//! A command owns everything one operation needs: the prepared native call,
//! its result, the conversion run at respond time and the caller's
//! completion.
//!
//! ```text
//! Created -> Prepared -> Queued -> Executing -> Completed -> Responded
//!                  \___________________________________________/
//!                    (validation error or no native call needed)
//! ```
//!
//! `execute` runs on a worker thread; `respond` runs in the dispatch loop.

use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;

use tracing::debug;

use ckv_common::Status;

use crate::completion::Completion;
use crate::error::{CallSite, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    Created,
    Prepared,
    Queued,
    Executing,
    Completed,
    Responded,
}

type Execute<O> = Box<dyn FnOnce() -> Result<O> + Send + 'static>;
type Convert<O, T> = Box<dyn FnOnce(Result<O>) -> Result<T> + Send + 'static>;

/// Type-erased command, as seen by the bridge.
pub(crate) trait Job: Send + 'static {
    fn name(&self) -> &'static str;

    fn state(&self) -> CommandState;

    /// True when a native call is pending.
    fn can_execute(&self) -> bool;

    fn queue(&mut self);

    /// Runs the native call. Blocking.
    fn execute(&mut self);

    /// Converts the result and invokes the completion exactly once.
    fn respond(&mut self);
}

pub(crate) struct Command<O: Send + 'static, T: Send + 'static> {
    name: &'static str,
    state: CommandState,
    execute: Option<Execute<O>>,
    convert: Option<Convert<O, T>>,
    result: Option<Result<O>>,
    completion: Option<Completion<T>>,
    call_site: Option<Arc<CallSite>>,
}

impl<T: Send + 'static> Command<T, T> {
    /// Command whose native result is delivered unchanged.
    pub(crate) fn direct(
        name: &'static str,
        completion: Completion<T>,
        call_site: Option<Arc<CallSite>>,
    ) -> Self {
        Command::new(name, completion, call_site, |result| result)
    }
}

impl<O: Send + 'static, T: Send + 'static> Command<O, T> {
    pub(crate) fn new(
        name: &'static str,
        completion: Completion<T>,
        call_site: Option<Arc<CallSite>>,
        convert: impl FnOnce(Result<O>) -> Result<T> + Send + 'static,
    ) -> Self {
        Command {
            name,
            state: CommandState::Created,
            execute: None,
            convert: Some(Box::new(convert)),
            result: None,
            completion: Some(completion),
            call_site,
        }
    }

    /// Stores the native call, or the error that replaces it.
    pub(crate) fn prepare<F>(&mut self, prepared: Result<F>)
    where
        F: FnOnce() -> Result<O> + Send + 'static,
    {
        match prepared {
            Ok(execute) => {
                self.execute = Some(Box::new(execute));
                self.state = CommandState::Prepared;
            }
            Err(err) => self.set_error(err),
        }
    }

    /// Skips execution; the error is delivered at respond time.
    pub(crate) fn set_error(&mut self, err: Error) {
        debug!(command = self.name, error = %err, "command rejected");
        self.execute = None;
        self.result = Some(Err(err));
        self.state = CommandState::Prepared;
    }

    /// Skips execution with an already known value.
    pub(crate) fn set_result(&mut self, value: O) {
        self.execute = None;
        self.result = Some(Ok(value));
        self.state = CommandState::Prepared;
    }
}

impl<O: Send + 'static, T: Send + 'static> Job for Command<O, T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> CommandState {
        self.state
    }

    fn can_execute(&self) -> bool {
        matches!(self.state, CommandState::Prepared | CommandState::Queued)
            && self.execute.is_some()
    }

    fn queue(&mut self) {
        if self.state == CommandState::Prepared {
            self.state = CommandState::Queued;
        }
    }

    fn execute(&mut self) {
        let Some(execute) = self.execute.take() else {
            return;
        };
        self.state = CommandState::Executing;
        debug!(command = self.name, "executing");

        let result = panic::catch_unwind(AssertUnwindSafe(execute)).unwrap_or_else(|_| {
            Err(Error::new(Status::ClientFailure, "command execution panicked"))
        });
        self.result = Some(result);
        self.state = CommandState::Completed;
    }

    fn respond(&mut self) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        let result = self.result.take().unwrap_or_else(|| {
            Err(Error::new(Status::ClientFailure, "command finished without a result"))
        });
        let converted = match self.convert.take() {
            Some(convert) => convert(result),
            None => Err(Error::new(Status::ClientFailure, "command already converted")),
        };
        let converted = converted.map_err(|err| err.with_call_site(self.call_site.clone()));

        debug!(command = self.name, ok = converted.is_ok(), "responding");
        self.state = CommandState::Responded;
        completion.complete(converted);
    }
}

impl<O: Send + 'static, T: Send + 'static> Drop for Command<O, T> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Err(Error::new(
                Status::ClientFailure,
                format!("{} command dropped before responding", self.name),
            )));
        }
    }
}

/// Captures the call site of a command when capture mode is on.
pub(crate) fn call_site(
    capture: bool,
    location: &'static Location<'static>,
) -> Option<Arc<CallSite>> {
    capture.then(|| Arc::new(CallSite::capture(location)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder<T: Send + 'static>() -> (Completion<T>, Arc<Mutex<Vec<Result<T>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (
            Completion::callback(move |result| sink.lock().unwrap().push(result)),
            seen,
        )
    }

    #[test]
    fn walks_the_full_lifecycle() {
        let (completion, seen) = recorder::<u32>();
        let mut command = Command::new("double", completion, None, |r: Result<u32>| {
            r.map(|v| v * 2)
        });
        assert_eq!(command.state(), CommandState::Created);

        command.prepare(Ok(|| Ok(21u32)));
        assert!(command.can_execute());
        command.queue();
        assert_eq!(command.state(), CommandState::Queued);
        assert!(command.can_execute());

        command.execute();
        assert_eq!(command.state(), CommandState::Completed);
        assert!(seen.lock().unwrap().is_empty());

        command.respond();
        assert_eq!(command.state(), CommandState::Responded);
        command.respond();
        drop(command);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap(), &42);
    }

    #[test]
    fn prepare_errors_skip_execution_and_keep_call_site() {
        let (completion, seen) = recorder::<u32>();
        let site = call_site(true, Location::caller());
        let mut command = Command::direct("get", completion, site);
        command.prepare::<fn() -> Result<u32>>(Err(Error::param("bad policy")));
        assert!(!command.can_execute());

        command.respond();
        let seen = seen.lock().unwrap();
        let err = seen[0].as_ref().unwrap_err();
        assert_eq!(err.status(), Status::InvalidParam);
        assert!(err.call_site().is_some());
    }

    #[test]
    fn panicking_execution_becomes_an_error() {
        let (completion, seen) = recorder::<u32>();
        let mut command = Command::direct("boom", completion, None);
        command.prepare(Ok(|| -> Result<u32> { panic!("worker failure") }));
        command.execute();
        command.respond();
        assert_eq!(
            seen.lock().unwrap()[0].as_ref().unwrap_err().status(),
            Status::ClientFailure
        );
    }

    #[test]
    fn dropped_commands_still_complete() {
        let (completion, seen) = recorder::<u32>();
        drop(Command::direct("lost", completion, None));
        assert!(seen.lock().unwrap()[0].is_err());
    }
}
