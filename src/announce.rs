use std::time::{Duration, Instant};

/// Minimum time before the same text is repeated.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Something that can tell the user a short piece of text.
pub trait Announcer {
    /// Announce `text`.
    fn say(&mut self, text: &str);
}

/// Prints announcements to stdout as `[SAY]: text`.
#[derive(Debug, Default)]
pub struct ConsoleVoice;

impl Announcer for ConsoleVoice {
    fn say(&mut self, text: &str) {
        println!("[SAY]: {text}");
    }
}

/// Suppresses repeats of the last text within `min_interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<(String, Instant)>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_INTERVAL)
    }
}

impl Throttle {
    /// Throttle with a custom repeat interval.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Whether `text` may be announced at `now`; records it when it may.
    pub fn allow(&mut self, text: &str, now: Instant) -> bool {
        let allowed = match &self.last {
            None => true,
            Some((last, at)) => last != text || now.saturating_duration_since(*at) > self.min_interval,
        };
        if allowed {
            self.last = Some((text.to_string(), now));
        }
        allowed
    }

    /// Forget the last announcement.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// An [`Announcer`] behind a [`Throttle`].
#[derive(Debug, Default)]
pub struct ThrottledAnnouncer<A> {
    inner: A,
    throttle: Throttle,
}

impl<A: Announcer> ThrottledAnnouncer<A> {
    /// Wrap `inner` with the given throttle.
    pub fn new(inner: A, throttle: Throttle) -> Self {
        Self { inner, throttle }
    }

    /// Announce `text` unless it repeats the last one too soon. Returns
    /// whether it was announced.
    pub fn say_at(&mut self, text: &str, now: Instant) -> bool {
        if !self.throttle.allow(text, now) {
            tracing::debug!(text, "announcement throttled");
            return false;
        }
        self.inner.say(text);
        true
    }

    /// Forget the last announcement, e.g. after a mode change.
    pub fn reset(&mut self) {
        self.throttle.reset();
    }

    /// The wrapped announcer.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: Announcer> Announcer for ThrottledAnnouncer<A> {
    fn say(&mut self, text: &str) {
        self.say_at(text, Instant::now());
    }
}
