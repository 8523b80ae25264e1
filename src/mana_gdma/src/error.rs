/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::time::Duration;

use thiserror::Error;

use crate::mem::AllocError;
use crate::queue::QueueKind;

/// The error type for GDMA operations
#[derive(Error, Debug)]
pub enum GdmaError {
    /// Allocation of DMA memory failed
    #[error("DMA allocation failed: {0}")]
    Alloc(#[from] AllocError),

    /// Unexpected bootstrap (shared memory channel) response
    #[error("Bootstrap response rejected: {0}")]
    BootstrapRejected(String),

    /// The completion queue table already holds a queue with this id
    #[error("Completion queue slot {0} is already taken")]
    CqSlotTaken(u32),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// Caller supplied an argument the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Memory access through the DMA backend failed
    #[error("Memory access at {0:#x} failed")]
    MemAccess(u64),

    /// Resource pool has no free ids left
    #[error("Resource pool of {0} ids is exhausted")]
    PoolExhausted(usize),

    /// Owner bits show the producer lapped the consumer
    #[error("{kind} queue {id} overflow detected")]
    QueueOverflow {
        /// Kind of the overflowing queue
        kind: QueueKind,
        /// Hardware id of the queue
        id: u32,
    },

    /// A request does not fit in the hardware channel message buffer
    #[error("Request of {0} bytes does not fit the {1} byte message buffer")]
    RequestTooLarge(usize, usize),

    /// Response did not fit the caller's buffer, or was shorter than a response header
    #[error("Response of {len} bytes is invalid for a {capacity} byte output buffer")]
    ResponseSize {
        /// Length of the response reported by the device
        len: usize,
        /// Capacity of the caller's output buffer
        capacity: usize,
    },

    /// The device answered a request with a non success status
    #[error("Request {msg_type} failed with status {status:#x}")]
    ResponseStatus {
        /// Message type of the failed request
        msg_type: u32,
        /// Status code returned by the device
        status: u32,
    },

    /// Not enough space is left in a work queue
    #[error("Work queue needs {needed} bytes but only {available} are free")]
    RingFull {
        /// Size of the entry being posted
        needed: u32,
        /// Space currently available
        available: u32,
    },

    /// Hardware channel bring-up failed
    #[error("Hardware channel setup failed: {0}")]
    Setup(String),

    /// Completing entries would move the tail past the head
    #[error("Advancing tail {tail} by {units} would pass head {head}")]
    TailOverrun {
        /// Current head in 32-byte units
        head: u32,
        /// Current tail in 32-byte units
        tail: u32,
        /// Requested advance
        units: u32,
    },

    /// Waited too long for the device
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    /// A test event arrived on an unexpected event queue
    #[error("Test event arrived on queue {got}, expected {expected}")]
    WrongTestEvent {
        /// Queue the test event was generated for
        expected: u32,
        /// Queue the event showed up on
        got: u32,
    },

    /// The work request is larger than the queue kind allows
    #[error("Work request of {0} bytes exceeds the {1} byte limit")]
    WqeTooLarge(u32, u32),
}

/// Coarse classification of a [`GdmaError`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    /// Rejected synchronously before any state changed
    Admission,
    /// The device or the wire format misbehaved
    Protocol,
    /// The device did not answer in time
    Timeout,
    /// Bring-up could not complete
    Setup,
}

impl GdmaError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        // wildcard _ or matches! not used here purposefully to ensure that new error variants
        // are explicitly classified.
        match self {
            GdmaError::Alloc(_)
            | GdmaError::CqSlotTaken(_)
            | GdmaError::InvalidArgument(_)
            | GdmaError::PoolExhausted(_)
            | GdmaError::RequestTooLarge(_, _)
            | GdmaError::RingFull { .. }
            | GdmaError::TailOverrun { .. }
            | GdmaError::WqeTooLarge(_, _) => ErrorClass::Admission,

            GdmaError::Error(_)
            | GdmaError::MemAccess(_)
            | GdmaError::QueueOverflow { .. }
            | GdmaError::ResponseSize { .. }
            | GdmaError::ResponseStatus { .. }
            | GdmaError::BootstrapRejected(_)
            | GdmaError::WrongTestEvent { .. } => ErrorClass::Protocol,

            GdmaError::Timeout(_, _) => ErrorClass::Timeout,

            GdmaError::Setup(_) => ErrorClass::Setup,
        }
    }
}

/// The result type for GDMA operations
pub type Result<T> = std::result::Result<T, GdmaError>;

/// Creates a [`GdmaError::Error`] from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::GdmaError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::GdmaError::Error(__err_msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variants() {
        assert_eq!(GdmaError::PoolExhausted(4).class(), ErrorClass::Admission);
        assert_eq!(
            GdmaError::RingFull {
                needed: 64,
                available: 32
            }
            .class(),
            ErrorClass::Admission
        );
        assert_eq!(
            GdmaError::ResponseStatus {
                msg_type: 12,
                status: 1
            }
            .class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            GdmaError::Timeout(Duration::from_secs(1), "response").class(),
            ErrorClass::Timeout
        );
        assert_eq!(
            GdmaError::Setup("no init".to_string()).class(),
            ErrorClass::Setup
        );
    }

    #[test]
    fn new_error_formats() {
        let err = new_error!("queue {} gone", 7);
        assert_eq!(err.to_string(), "queue 7 gone");
        let err = new_error!("plain");
        assert!(matches!(err, GdmaError::Error(ref s) if s == "plain"));
    }
}
