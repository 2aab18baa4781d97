//! Recorded state of one broker transaction.

use crate::{
    command::Command,
    error::{Result, WirebusError},
};

/// Journal of a transaction in flight, kept so a reconnecting transport can
/// replay the work performed inside it.
#[derive(Debug, Default)]
pub struct TransactionState {
    commands: Vec<Command>,
    prepared: bool,
    prepared_result: i32,
    shutdown: bool,
}

impl TransactionState {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Record a command issued inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_command(&mut self, command: Command) -> Result<()> {
        self.check_shutdown()?;
        self.commands.push(command);
        Ok(())
    }

    /// Mark the transaction prepared with the coordinator's vote.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn set_prepared(&mut self, result: i32) -> Result<()> {
        self.check_shutdown()?;
        self.prepared = true;
        self.prepared_result = result;
        Ok(())
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] { &self.commands }

    #[must_use]
    pub fn is_prepared(&self) -> bool { self.prepared }

    #[must_use]
    pub fn prepared_result(&self) -> i32 { self.prepared_result }

    pub fn shutdown(&mut self) { self.shutdown = true; }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown {
            Err(WirebusError::Disposed("transaction state"))
        } else {
            Ok(())
        }
    }
}
