//! Deferred request completion.
//!
//! A guest request whose sub-operations complete asynchronously cannot return
//! its chain from the notify path. [`Request`] holds the chain together with
//! an explicit outstanding-operation counter and a worst-observed status;
//! the chain is released exactly once, when the counter drains to zero after
//! submission has finished. The counter, not drop order, decides the release
//! point, which keeps the exactly-once guarantee auditable.

use crate::queue::Chain;

/// Outcome of folding one sub-operation completion into a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// Sub-operations are still outstanding.
    Pending,
    /// This completion was the last one; the request is ready to finish.
    Finished,
}

#[derive(Debug)]
pub struct Request {
    chain: Chain,
    outstanding: usize,
    submitted: bool,
    status: u8,
    status_ok: u8,
}

impl Request {
    /// `status_ok` is the device's success code; completions fold in via
    /// [`Request::worst`] of the device's status ordering.
    pub fn new(chain: Chain, status_ok: u8) -> Self {
        Self {
            chain,
            outstanding: 0,
            submitted: false,
            status: status_ok,
            status_ok,
        }
    }

    /// Registers one sub-operation before it is issued to a collaborator.
    pub fn begin(&mut self) {
        self.outstanding += 1;
    }

    /// Marks submission complete: no further [`Request::begin`] calls will
    /// follow. Returns `Finished` if nothing is (or was) outstanding.
    pub fn seal(&mut self) -> Completion {
        self.submitted = true;
        if self.outstanding == 0 {
            Completion::Finished
        } else {
            Completion::Pending
        }
    }

    /// Folds in one sub-operation result. Must be called exactly once per
    /// [`Request::begin`].
    pub fn complete(&mut self, status: u8) -> Completion {
        self.status = worst(self.status, status, self.status_ok);
        self.outstanding -= 1;
        if self.submitted && self.outstanding == 0 {
            Completion::Finished
        } else {
            Completion::Pending
        }
    }

    /// Overrides the folded status with a worse one observed outside a
    /// sub-operation (e.g. a malformed trailing descriptor).
    pub fn fail(&mut self, status: u8) {
        self.status = worst(self.status, status, self.status_ok);
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn chain_mut(&mut self) -> &mut Chain {
        &mut self.chain
    }

    /// Consumes the request, yielding the chain and final status for the
    /// used-ring publish.
    pub fn finish(self) -> (Chain, u8) {
        (self.chain, self.status)
    }
}

/// Worst-observed status fold: the first non-OK code sticks; later
/// completions never mask an earlier failure.
fn worst(current: u8, new: u8, ok: u8) -> u8 {
    if current != ok {
        current
    } else {
        new
    }
}
