//! Gapless playback scheduling.
//!
//! Model audio arrives in bursts faster than real time. Each chunk is
//! scheduled to start when the previous one ends, or now if the queue has
//! drained. Times are offsets from the owning session's clock origin so the
//! queue itself never reads a clock.

use std::collections::VecDeque;
use std::time::Duration;

use super::codec::samples_to_duration;

/// Where a chunk landed on the playback timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start: Duration,
    pub end: Duration,
}

impl ScheduledChunk {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Result of cutting playback short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interruption {
    /// Item whose audio was playing, used to truncate the model's copy.
    pub item_id: Option<String>,
    /// How much of that item the user actually heard.
    pub played: Duration,
    /// Scheduled audio that will never play.
    pub discarded: Duration,
}

impl Interruption {
    pub fn played_ms(&self) -> u32 {
        self.played.as_millis().min(u32::MAX as u128) as u32
    }
}

#[derive(Debug, Clone)]
struct QueuedChunk {
    item_id: Option<String>,
    start: Duration,
    end: Duration,
}

/// Playback timeline for a single session.
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    cursor: Duration,
    queued: VecDeque<QueuedChunk>,
    /// Audio already finished for the most recent item.
    finished: Option<(Option<String>, Duration)>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the last scheduled chunk.
    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    /// Schedule `samples` samples at `sample_rate` belonging to `item_id`.
    pub fn schedule(
        &mut self,
        item_id: Option<&str>,
        samples: usize,
        sample_rate: u32,
        now: Duration,
    ) -> ScheduledChunk {
        self.prune(now);

        let start = self.cursor.max(now);
        let end = start + samples_to_duration(samples, sample_rate);
        self.cursor = end;
        self.queued.push_back(QueuedChunk {
            item_id: item_id.map(str::to_string),
            start,
            end,
        });

        ScheduledChunk { start, end }
    }

    /// Whether any scheduled audio is still audible at `now`.
    pub fn is_playing(&self, now: Duration) -> bool {
        self.cursor > now
    }

    /// Scheduled audio remaining after `now`.
    pub fn pending(&self, now: Duration) -> Duration {
        self.cursor.saturating_sub(now)
    }

    /// Stop everything. Returns `None` if nothing was audible.
    pub fn interrupt(&mut self, now: Duration) -> Option<Interruption> {
        self.prune(now);

        let interruption = if self.is_playing(now) {
            let current = self.queued.front().and_then(|c| c.item_id.clone());
            let mut played = match &self.finished {
                Some((item, heard)) if *item == current => *heard,
                _ => Duration::ZERO,
            };
            let mut discarded = Duration::ZERO;
            for chunk in &self.queued {
                if chunk.item_id == current {
                    played += now.saturating_sub(chunk.start).min(chunk.end - chunk.start);
                }
                discarded += chunk.end.saturating_sub(now.max(chunk.start));
            }
            Some(Interruption {
                item_id: current,
                played,
                discarded,
            })
        } else {
            None
        };

        self.clear();
        interruption
    }

    /// Drop all scheduled audio and rewind the cursor.
    pub fn clear(&mut self) {
        self.queued.clear();
        self.finished = None;
        self.cursor = Duration::ZERO;
    }

    fn prune(&mut self, now: Duration) {
        while let Some(chunk) = self.queued.front() {
            if chunk.end > now {
                break;
            }
            let heard = chunk.end - chunk.start;
            match &mut self.finished {
                Some((item, total)) if *item == chunk.item_id => *total += heard,
                _ => self.finished = Some((chunk.item_id.clone(), heard)),
            }
            self.queued.pop_front();
        }
    }
}
