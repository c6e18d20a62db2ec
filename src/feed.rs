use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl SubscriptionId {
    pub fn parse(s: &str) -> Option<SubscriptionId> {
        s.strip_prefix("sub-")?.parse().ok().map(SubscriptionId)
    }
}

type Callback<T> = Box<dyn Fn(SubscriptionId, &T)>;

/// Push-style feed: every published value goes to every live subscriber, in
/// subscription order.
pub struct Feed<T> {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Callback<T>)>,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Feed {
            next_id: 1,
            subscribers: Vec::new(),
        }
    }
}

impl<T> Feed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(SubscriptionId, &T) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn publish(&self, value: &T) {
        for (id, callback) in &self.subscribers {
            callback(*id, value);
        }
    }

    /// Delivers to a single subscriber (initial snapshot on subscribe).
    pub fn deliver(&self, id: SubscriptionId, value: &T) -> bool {
        match self.subscribers.iter().find(|(sid, _)| *sid == id) {
            Some((_, callback)) => {
                callback(id, value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}
