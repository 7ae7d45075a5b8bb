//! Source + filter + map composition for one subscription.

use crate::bus::{BusReleaser, BusSubscription};
use crate::error::{FeedError, Result};
use crate::timer::{Tick, TimerStream};
use crate::types::{ChangeEvent, Reading};
use crossbeam_channel::{after, select, Receiver};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// An item emitted upstream of a pipeline's filter.
#[derive(Clone, Debug)]
pub enum SourceItem {
    Tick(Tick),
    Change(ChangeEvent),
}

/// Where a pipeline pulls items from. A pipeline has exactly one source.
pub enum Source {
    Timer(TimerStream),
    Bus(BusSubscription),
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Source::Timer(_) => "timer",
            Source::Bus(_) => "bus",
        }
    }
}

pub type FilterFn = Box<dyn Fn(&SourceItem) -> Result<bool> + Send>;
pub type MapFn = Box<dyn Fn(SourceItem) -> Result<Reading> + Send>;

/// Outcome of pulling from a pipeline.
#[derive(Debug)]
pub enum Next {
    Payload(Reading),
    /// The cancel signal fired.
    Cancelled,
    /// The source ended normally.
    Completed,
    Failed(FeedError),
}

/// Releases a pipeline's source from outside the thread that drives it.
#[derive(Clone)]
pub struct SourceReleaser {
    bus: Option<BusReleaser>,
}

impl SourceReleaser {
    pub fn release(&self) {
        if let Some(ref bus) = self.bus {
            bus.release();
        }
    }
}

/// A cancellable stream of readings.
pub struct Pipeline {
    source: Source,
    filter: Option<FilterFn>,
    map: MapFn,
}

impl Pipeline {
    pub fn new<M>(source: Source, map: M) -> Self
    where
        M: Fn(SourceItem) -> Result<Reading> + Send + 'static,
    {
        Self {
            source,
            filter: None,
            map: Box::new(map),
        }
    }

    /// Only items for which `filter` returns true reach the map stage.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&SourceItem) -> Result<bool> + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    pub fn releaser(&self) -> SourceReleaser {
        SourceReleaser {
            bus: match &self.source {
                Source::Bus(sub) => Some(sub.releaser()),
                Source::Timer(_) => None,
            },
        }
    }

    /// Block until the next payload, a cancel signal, or the end of the
    /// source. `cancel` fires on any message or on disconnect.
    pub fn pull<T>(&mut self, cancel: &Receiver<T>) -> Next {
        loop {
            let item = match self.recv(cancel) {
                Ok(Some(item)) => item,
                Ok(None) => return Next::Cancelled,
                Err(Some(e)) => return Next::Failed(e),
                Err(None) => return Next::Completed,
            };

            match self.step(item) {
                Ok(Some(reading)) => return Next::Payload(reading),
                Ok(None) => continue,
                Err(e) => return Next::Failed(e),
            }
        }
    }

    /// Pull, treating an expired `timeout` as a cancel signal.
    pub fn pull_timeout(&mut self, timeout: Duration) -> Next {
        self.pull(&after(timeout))
    }

    /// `Ok(None)` = cancelled, `Err(None)` = ended normally.
    fn recv<T>(
        &mut self,
        cancel: &Receiver<T>,
    ) -> std::result::Result<Option<SourceItem>, Option<FeedError>> {
        match &mut self.source {
            Source::Timer(timer) => {
                let ticker = timer.receiver().clone();
                select! {
                    recv(cancel) -> _ => Ok(None),
                    recv(ticker) -> fired => match fired {
                        Ok(_) => Ok(Some(SourceItem::Tick(timer.advance()))),
                        Err(_) => Err(Some(FeedError::SourceFault("timer stopped".into()))),
                    },
                }
            }
            Source::Bus(sub) => {
                select! {
                    recv(cancel) -> _ => Ok(None),
                    recv(sub.receiver()) -> event => match event {
                        Ok(event) => Ok(Some(SourceItem::Change(event))),
                        Err(_) => Err(sub.end_error()),
                    },
                }
            }
        }
    }

    /// Run filter then map on one item. Panics in either stage become
    /// subscription faults.
    fn step(&self, item: SourceItem) -> Result<Option<Reading>> {
        if let Some(ref filter) = self.filter {
            let keep = catch_unwind(AssertUnwindSafe(|| filter(&item)))
                .map_err(|panic| FeedError::SubscriptionFault(panic_message(panic)))?
                .map_err(into_subscription_fault)?;
            if !keep {
                return Ok(None);
            }
        }

        let reading = catch_unwind(AssertUnwindSafe(|| (self.map)(item)))
            .map_err(|panic| FeedError::SubscriptionFault(panic_message(panic)))?
            .map_err(into_subscription_fault)?;
        Ok(Some(reading))
    }
}

fn into_subscription_fault(e: FeedError) -> FeedError {
    if e.is_subscription_terminal() {
        e
    } else {
        FeedError::SubscriptionFault(e.to_string())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
