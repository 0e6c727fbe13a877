/// Coalesces writes for one dimension: at most one in flight, and the most
/// recent request waiting behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLane<T> {
    in_flight: Option<T>,
    queued: Option<T>,
}

impl<T> Default for WriteLane<T> {
    fn default() -> Self {
        Self {
            in_flight: None,
            queued: None,
        }
    }
}

impl<T: Clone> WriteLane<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value to send now, or `None` if it was queued behind the
    /// write in flight (replacing anything queued before it).
    pub fn submit(&mut self, value: T) -> Option<T> {
        if self.in_flight.is_some() {
            self.queued = Some(value);
            None
        } else {
            self.in_flight = Some(value.clone());
            Some(value)
        }
    }

    /// Marks the in-flight write finished and promotes the queued value.
    pub fn complete(&mut self) -> Option<T> {
        self.in_flight = self.queued.take();
        self.in_flight.clone()
    }

    /// The newest value requested and not yet settled.
    pub fn latest(&self) -> Option<&T> {
        self.queued.as_ref().or(self.in_flight.as_ref())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}
