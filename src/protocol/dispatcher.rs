//! Request/response correlation.
//!
//! Every outbound [`Request`] carries a predicate over inbound commands.
//! Inbound commands are tested against pending requests in submission order
//! and the first match takes the command. Requests may chain a successor,
//! which the caller sends once the predecessor completes (and, if
//! configured, when it times out).

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::core::frame::Channel;
use crate::error::ProtocolError;
use crate::protocol::command::Command;
use crate::utils::metrics::global_metrics;

pub type RequestId = u64;

type CompleteFn = Box<dyn FnMut(&Command) + Send>;
type TimeoutFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(&ProtocolError) + Send>;

/// Matches inbound commands by category and optional subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMatcher {
    pub category: u16,
    pub subtype: Option<u16>,
}

impl CommandMatcher {
    pub fn category(category: u16) -> Self {
        Self {
            category,
            subtype: None,
        }
    }

    pub fn exact(category: u16, subtype: u16) -> Self {
        Self {
            category,
            subtype: Some(subtype),
        }
    }

    pub fn matches(&self, command: &Command) -> bool {
        command.category == self.category && self.subtype.map_or(true, |s| s == command.subtype)
    }
}

/// An outbound payload plus what to do with its response.
///
/// Without a matcher the request completes as soon as it has been written
/// to the transport.
pub struct Request {
    channel: Channel,
    payload: Bytes,
    matcher: Option<CommandMatcher>,
    timeout: Option<Duration>,
    next: Option<Box<Request>>,
    advance_on_timeout: bool,
    persistent: bool,
    on_complete: Option<CompleteFn>,
    on_timeout: Option<TimeoutFn>,
    on_error: Option<ErrorFn>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("channel", &self.channel)
            .field("len", &self.payload.len())
            .field("matcher", &self.matcher)
            .field("timeout", &self.timeout)
            .field("chained", &self.next.is_some())
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl Request {
    /// A request sending already-serialized `payload` on `channel`
    pub fn new(channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
            matcher: None,
            timeout: None,
            next: None,
            advance_on_timeout: false,
            persistent: false,
            on_complete: None,
            on_timeout: None,
            on_error: None,
        }
    }

    /// Wait for an inbound command matching `matcher`
    pub fn expect(mut self, matcher: CommandMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Override the default response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Append `next` to the end of this request's chain
    pub fn then(mut self, next: Request) -> Self {
        let tail = match self.next.take() {
            Some(existing) => existing.then(next),
            None => next,
        };
        self.next = Some(Box::new(tail));
        self
    }

    /// Send the successor even if this request times out
    pub fn advance_on_timeout(mut self, advance: bool) -> Self {
        self.advance_on_timeout = advance;
        self
    }

    /// Stay registered after the first match
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Command) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&ProtocolError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn matcher(&self) -> Option<CommandMatcher> {
        self.matcher
    }

    fn take_next(&mut self) -> Option<Request> {
        self.next.take().map(|next| *next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Matched,
    TimedOut,
    Failed,
}

/// Result of a request having been written to the transport
#[derive(Debug)]
pub enum SendOutcome {
    /// Waiting for a response; arm a timer for `timeout`
    Awaiting { timeout: Duration },
    /// No response expected; the request is done
    Finished { next: Option<Request> },
    /// The request is no longer pending
    Unknown,
}

/// Result of offering an inbound command to the pending requests
#[derive(Debug)]
pub enum Dispatch {
    Matched { id: RequestId, next: Option<Request> },
    Unmatched,
}

struct Pending {
    id: RequestId,
    state: RequestState,
    matched_once: bool,
    request: Request,
}

/// Ordered set of outstanding requests for one connection
pub struct Dispatcher {
    next_id: RequestId,
    default_timeout: Duration,
    pending: Vec<Pending>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            default_timeout,
            pending: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.find(id).map(|p| p.state)
    }

    /// Register a request; it stays `Created` until [`mark_sent`](Self::mark_sent)
    pub fn submit(&mut self, request: Request) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        trace!(id, ?request, "request submitted");
        self.pending.push(Pending {
            id,
            state: RequestState::Created,
            matched_once: false,
            request,
        });
        id
    }

    /// The request's payload was written to the transport
    pub fn mark_sent(&mut self, id: RequestId) -> SendOutcome {
        let default_timeout = self.default_timeout;
        let Some(position) = self.position(id) else {
            return SendOutcome::Unknown;
        };
        let pending = &mut self.pending[position];
        if pending.state != RequestState::Created {
            return SendOutcome::Unknown;
        }

        if pending.request.matcher.is_some() {
            pending.state = RequestState::Sent;
            return SendOutcome::Awaiting {
                timeout: pending.request.timeout.unwrap_or(default_timeout),
            };
        }

        let mut finished = self.pending.remove(position);
        finished.state = RequestState::Matched;
        global_metrics().request_completed();
        debug!(id, "request sent, no response expected");
        SendOutcome::Finished {
            next: finished.request.take_next(),
        }
    }

    /// Offer an inbound command to the pending requests
    pub fn on_command(&mut self, command: &Command) -> Dispatch {
        let Some(position) = self.pending.iter().position(|p| {
            p.state == RequestState::Sent
                && p.request.matcher.is_some_and(|m| m.matches(command))
        }) else {
            return Dispatch::Unmatched;
        };

        let pending = &mut self.pending[position];
        let id = pending.id;
        if let Some(callback) = pending.request.on_complete.as_mut() {
            callback(command);
        }

        if pending.request.persistent {
            let first = !pending.matched_once;
            pending.matched_once = true;
            trace!(id, %command, "persistent request matched");
            let next = if first { pending.request.take_next() } else { None };
            if first {
                global_metrics().request_completed();
            }
            return Dispatch::Matched { id, next };
        }

        let mut matched = self.pending.remove(position);
        matched.state = RequestState::Matched;
        global_metrics().request_completed();
        debug!(id, %command, "request matched");
        Dispatch::Matched {
            id,
            next: matched.request.take_next(),
        }
    }

    /// The response timer for `id` fired. Returns the successor to send if
    /// the request advances on timeout.
    pub fn on_timeout(&mut self, id: RequestId) -> Option<Request> {
        let position = self.position(id)?;
        let pending = &self.pending[position];
        if pending.state != RequestState::Sent {
            return None;
        }
        if pending.request.persistent && pending.matched_once {
            trace!(id, "persistent request keeps listening past its timeout");
            return None;
        }

        let mut expired = self.pending.remove(position);
        expired.state = RequestState::TimedOut;
        global_metrics().request_timed_out();
        warn!(id, channel = %expired.request.channel, "request timed out");

        if let Some(callback) = expired.request.on_timeout.take() {
            callback();
        }
        if expired.request.advance_on_timeout {
            expired.request.take_next()
        } else {
            if expired.request.next.is_some() {
                debug!(id, "request chain halted by timeout");
            }
            None
        }
    }

    /// Fail `id`, halting its chain
    pub fn fail(&mut self, id: RequestId, error: &ProtocolError) -> bool {
        let Some(position) = self.position(id) else {
            return false;
        };
        let mut failed = self.pending.remove(position);
        failed.state = RequestState::Failed;
        global_metrics().request_failed();
        warn!(id, %error, "request failed");
        if failed.request.next.is_some() {
            debug!(id, "request chain halted by failure");
        }
        if let Some(callback) = failed.request.on_error.take() {
            callback(error);
        }
        true
    }

    /// Fail every pending request with the error produced by `make_error`
    pub fn fail_all<F>(&mut self, make_error: F) -> Vec<RequestId>
    where
        F: Fn() -> ProtocolError,
    {
        let drained: Vec<Pending> = self.pending.drain(..).collect();
        let mut ids = Vec::with_capacity(drained.len());
        for mut pending in drained {
            let error = make_error();
            global_metrics().request_failed();
            debug!(id = pending.id, %error, "failing pending request");
            if let Some(callback) = pending.request.on_error.take() {
                callback(&error);
            }
            ids.push(pending.id);
        }
        ids
    }

    /// Drop `id` without invoking any callback
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.position(id) {
            Some(position) => {
                self.pending.remove(position);
                true
            }
            None => false,
        }
    }

    fn position(&self, id: RequestId) -> Option<usize> {
        self.pending.iter().position(|p| p.id == id)
    }

    fn find(&self, id: RequestId) -> Option<&Pending> {
        self.pending.iter().find(|p| p.id == id)
    }
}
