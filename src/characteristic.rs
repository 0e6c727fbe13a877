//! Host-visible characteristic values.
//!
//! A [`Characteristic`] is a shared cell the host observes. Controllers push
//! device truth into it with [`Characteristic::update`]; nothing in here
//! routes back into the write path, so mirroring a device event can never
//! trigger a device write.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// What the host currently displays for a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading<T> {
    Value(T),
    /// Error sentinel shown while the device cannot be reached.
    Unreachable,
}

impl<T: Copy> Reading<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Unreachable => None,
        }
    }
}

struct Cell<T> {
    last: T,
    reachable: bool,
}

struct Inner<T> {
    name: &'static str,
    bounds: Option<(T, T)>,
    cell: Mutex<Cell<T>>,
    tx: watch::Sender<Reading<T>>,
}

/// A typed, observable host characteristic.
pub struct Characteristic<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Characteristic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Characteristic<T>
where
    T: Copy + PartialOrd + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, initial: T) -> Self {
        Self::build(name, initial, None)
    }

    /// A characteristic whose values are clamped into `min..=max`.
    pub fn ranged(name: &'static str, initial: T, min: T, max: T) -> Self {
        Self::build(name, initial, Some((min, max)))
    }

    fn build(name: &'static str, initial: T, bounds: Option<(T, T)>) -> Self {
        let initial = clamp(initial, bounds);
        let (tx, _) = watch::channel(Reading::Value(initial));
        Self {
            inner: Arc::new(Inner {
                name,
                bounds,
                cell: Mutex::new(Cell {
                    last: initial,
                    reachable: true,
                }),
                tx,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Last known value, even while the sentinel is displayed.
    pub fn value(&self) -> T {
        self.inner.cell.lock().last
    }

    /// What the host is currently shown.
    pub fn reading(&self) -> Reading<T> {
        *self.inner.tx.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.cell.lock().reachable
    }

    /// Records a confirmed value. While unreachable the value is remembered
    /// but the sentinel stays on display.
    pub fn update(&self, value: T) {
        let value = clamp(value, self.inner.bounds);
        let mut cell = self.inner.cell.lock();
        cell.last = value;
        if cell.reachable {
            self.inner.tx.send_replace(Reading::Value(value));
        }
    }

    pub fn mark_unreachable(&self) {
        let mut cell = self.inner.cell.lock();
        cell.reachable = false;
        self.inner.tx.send_replace(Reading::Unreachable);
    }

    /// Leaves the unreachable state, redisplaying the last known value.
    pub fn mark_reachable(&self) {
        let mut cell = self.inner.cell.lock();
        cell.reachable = true;
        self.inner.tx.send_replace(Reading::Value(cell.last));
    }

    pub fn subscribe(&self) -> watch::Receiver<Reading<T>> {
        self.inner.tx.subscribe()
    }
}

impl<T: Debug + Copy> Debug for Characteristic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("name", &self.inner.name)
            .field("reading", &*self.inner.tx.borrow())
            .finish()
    }
}

fn clamp<T: PartialOrd>(value: T, bounds: Option<(T, T)>) -> T {
    match bounds {
        Some((min, _)) if value < min => min,
        Some((_, max)) if value > max => max,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranged_clamps() {
        let speed = Characteristic::ranged("RotationSpeed", 50u8, 1, 100);
        speed.update(0);
        assert_eq!(speed.value(), 1);
        speed.update(250);
        assert_eq!(speed.reading(), Reading::Value(100));
    }

    #[test]
    fn test_unreachable_keeps_last_value() {
        let power = Characteristic::new("On", false);
        power.update(true);
        power.mark_unreachable();
        assert_eq!(power.reading(), Reading::Unreachable);
        assert!(power.value());

        power.update(false);
        assert_eq!(power.reading(), Reading::Unreachable);

        power.mark_reachable();
        assert_eq!(power.reading(), Reading::Value(false));
    }

    #[test]
    fn test_subscribers_see_updates() {
        let hue = Characteristic::ranged("Hue", 0u16, 0, 360);
        let mut rx = hue.subscribe();
        hue.update(200);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Reading::Value(200));
    }
}
