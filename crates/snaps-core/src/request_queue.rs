use std::collections::HashMap;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Maximum number of requests reached. Try again later.")]
    Full { origin: String, max: usize },
    #[error("Cannot decrement, `{origin}` does not have any outstanding requests.")]
    Empty { origin: String },
}

/// Bounded per-origin counter of callers waiting on a module to start.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    max: usize,
    counts: HashMap<String, usize>,
}

impl RequestQueue {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            counts: HashMap::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn increment(&mut self, origin: &str) -> Result<usize, QueueError> {
        let current = self.get(origin);
        if current >= self.max {
            return Err(QueueError::Full {
                origin: origin.to_string(),
                max: self.max,
            });
        }
        self.counts.insert(origin.to_string(), current + 1);
        Ok(current + 1)
    }

    pub fn decrement(&mut self, origin: &str) -> Result<usize, QueueError> {
        let current = self.get(origin);
        if current == 0 {
            return Err(QueueError::Empty {
                origin: origin.to_string(),
            });
        }
        if current == 1 {
            self.counts.remove(origin);
        } else {
            self.counts.insert(origin.to_string(), current - 1);
        }
        Ok(current - 1)
    }

    pub fn get(&self, origin: &str) -> usize {
        self.counts.get(origin).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_up_to_capacity_per_origin() {
        let mut queue = RequestQueue::new(2);
        assert_eq!(queue.increment("a"), Ok(1));
        assert_eq!(queue.increment("a"), Ok(2));
        let err = queue.increment("a").expect_err("full");
        assert!(err.to_string().contains("Maximum number of requests"));
        assert_eq!(queue.increment("b"), Ok(1));
        assert_eq!(queue.get("a"), 2);
    }

    #[test]
    fn decrement_below_zero_is_an_error() {
        let mut queue = RequestQueue::new(5);
        assert!(matches!(queue.decrement("a"), Err(QueueError::Empty { .. })));
        queue.increment("a").expect("increment");
        assert_eq!(queue.decrement("a"), Ok(0));
        assert_eq!(queue.get("a"), 0);
        assert_eq!(queue.max_size(), 5);
    }
}
