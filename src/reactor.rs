//! Reactor: the single-threaded poll/dispatch loop.
//!
//! Each pass: every registered entity syncs its poller interests and may
//! hint that it wants to run again immediately; one OS readiness wait
//! happens (zero timeout while any hint is pending); readiness is dispatched
//! in registration order; entities reporting termination are removed. The
//! loop ends when the registry drains, which in long-running mode is never.

use mio::{Events, Poll, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tracing::{info, trace};

/// Idle poll bound when no entity hints for an immediate re-poll.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;

const EVENTS_CAPACITY: usize = 256;

/// Whether a pollable entity should stay in the registry after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Terminated,
}

/// Per-token readiness for one reactor pass.
#[derive(Debug, Default)]
pub struct Readiness {
    flags: HashMap<Token, (bool, bool)>,
}

impl Readiness {
    /// Merges a readiness report for a token.
    pub fn insert(&mut self, token: Token, readable: bool, writable: bool) {
        let entry = self.flags.entry(token).or_default();
        entry.0 |= readable;
        entry.1 |= writable;
    }

    /// (readable, writable) reported for a token this pass.
    pub fn flags(&self, token: Token) -> (bool, bool) {
        self.flags.get(&token).copied().unwrap_or((false, false))
    }
}

/// Dispatch-time services handed to pollables: the poller registry for
/// (de)registration, token allocation, and spawning of new entities.
pub struct DispatchCtx<'a> {
    pub registry: &'a Registry,
    next_token: &'a mut usize,
    spawned: &'a mut Vec<Box<dyn Pollable>>,
}

impl DispatchCtx<'_> {
    pub(crate) fn new<'a>(
        registry: &'a Registry,
        next_token: &'a mut usize,
        spawned: &'a mut Vec<Box<dyn Pollable>>,
    ) -> DispatchCtx<'a> {
        DispatchCtx {
            registry,
            next_token,
            spawned,
        }
    }

    /// Allocates a fresh poller token.
    pub fn next_token(&mut self) -> Token {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        token
    }

    /// Queues a new entity for the registry; it joins after this pass.
    pub fn spawn(&mut self, entity: Box<dyn Pollable>) {
        self.spawned.push(entity);
    }
}

/// Anything the reactor multiplexes: the listener and all live relays.
pub trait Pollable {
    /// Updates poller registrations ahead of the next wait. Returns true if
    /// the entity wants to be dispatched again without waiting for the OS.
    fn prepare(&mut self, registry: &Registry) -> io::Result<bool>;

    /// Reacts to this pass's readiness.
    fn dispatch(&mut self, ready: &Readiness, ctx: &mut DispatchCtx<'_>) -> Status;
}

/// The poll loop and its registry of pollable entities.
pub struct Reactor {
    poll: Poll,
    events: Events,
    entities: Vec<Box<dyn Pollable>>,
    next_token: usize,
    idle_timeout: Duration,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            entities: Vec::new(),
            next_token: 0,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocates a fresh poller token.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Appends an entity to the registry.
    pub fn add(&mut self, entity: Box<dyn Pollable>) {
        self.entities.push(entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Runs passes until the registry drains.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.entities.is_empty() {
            self.turn()?;
        }
        info!("done");
        Ok(())
    }

    /// One pass: collect interests, wait once, dispatch, sweep terminated.
    pub fn turn(&mut self) -> io::Result<()> {
        let registry = self.poll.registry();
        let mut immediate = false;
        for entity in self.entities.iter_mut() {
            immediate |= entity.prepare(registry)?;
        }

        let timeout = if immediate {
            Duration::ZERO
        } else {
            self.idle_timeout
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let mut ready = Readiness::default();
        for event in self.events.iter() {
            // Closed and error states surface through the read/write
            // attempts, so fold them into the plain readiness bits.
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            ready.insert(event.token(), readable, writable);
        }
        trace!(events = self.events.iter().count(), immediate, "reactor pass");

        let registry = self.poll.registry();
        let mut spawned: Vec<Box<dyn Pollable>> = Vec::new();
        let mut ctx = DispatchCtx::new(registry, &mut self.next_token, &mut spawned);
        self.entities
            .retain_mut(|entity| entity.dispatch(&ready, &mut ctx) == Status::Active);
        self.entities.append(&mut spawned);
        Ok(())
    }
}
