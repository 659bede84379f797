use std::{sync::Mutex, time::Duration};

/// Rolling voice-activity accounting for the audio streams of one session.
///
/// Buffers report per-packet dBov levels through `observe`; every interval
/// the session calls `calc` to rank which streams were actively speaking.
/// Observations for unregistered streams are ignored.
#[derive(Debug)]
pub struct AudioObserver {
    threshold: u8,
    interval: Duration,
    filter: i32,
    expected: i64,
    streams: Mutex<Vec<AudioStreamStat>>,
}

#[derive(Debug)]
struct AudioStreamStat {
    id: String,
    sum: i64,
    total: i64,
}

impl AudioObserver {
    /// `threshold` is the dBov value below which a sample counts as voice,
    /// `interval` the reporting period in milliseconds, `filter` the percent
    /// of voiced samples required for a stream to qualify as active.
    pub fn new(threshold: u8, interval: u64, filter: i32) -> Self {
        // Audio packets arrive roughly every 20ms.
        let expected = (interval as i64 / 20).max(1);
        Self {
            threshold,
            interval: Duration::from_millis(interval),
            filter,
            expected,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn add_stream(&self, stream_id: &str) {
        let mut streams = self.streams.lock().unwrap();
        if streams.iter().any(|s| s.id == stream_id) {
            return;
        }
        streams.push(AudioStreamStat {
            id: stream_id.to_owned(),
            sum: 0,
            total: 0,
        });
    }

    pub fn remove_stream(&self, stream_id: &str) {
        let mut streams = self.streams.lock().unwrap();
        streams.retain(|s| s.id != stream_id);
    }

    /// Records one audio-level sample. Cheap and safe to call from the
    /// packet path; levels above the threshold are counted as silence.
    pub fn observe(&self, stream_id: &str, dbov: u8) {
        if dbov > self.threshold {
            return;
        }
        let mut streams = self.streams.lock().unwrap();
        if let Some(stream) = streams.iter_mut().find(|s| s.id == stream_id) {
            stream.sum += dbov as i64;
            stream.total += 1;
        }
    }

    /// Ranks the streams that were voiced often enough during the elapsed
    /// interval, loudest first, and resets the accounting window.
    pub fn calc(&self) -> Vec<String> {
        let mut streams = self.streams.lock().unwrap();
        let mut active: Vec<(i64, String)> = streams
            .iter()
            .filter(|s| s.total > 0 && s.total * 100 / self.expected >= self.filter as i64)
            .map(|s| (s.sum / s.total, s.id.clone()))
            .collect();
        // Lower average dBov means louder.
        active.sort_by_key(|(avg, _)| *avg);

        for stream in streams.iter_mut() {
            stream.sum = 0;
            stream.total = 0;
        }

        active.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn observe_ignores_unregistered_streams() {
        let observer = AudioObserver::new(40, 1000, 20);
        observer.observe("ghost", 10);
        assert!(observer.calc().is_empty());
    }

    #[test]
    fn active_streams_are_ranked_loudest_first() {
        let observer = AudioObserver::new(40, 1000, 20);
        observer.add_stream("quiet");
        observer.add_stream("loud");
        observer.add_stream("silent");

        for _ in 0..50 {
            observer.observe("quiet", 35);
            observer.observe("loud", 10);
            // Above the threshold: counted as silence.
            observer.observe("silent", 90);
        }

        assert_eq!(observer.calc(), vec!["loud".to_owned(), "quiet".to_owned()]);
        // The window has been reset.
        assert!(observer.calc().is_empty());
    }

    #[test]
    fn sparse_speakers_are_filtered_out() {
        let observer = AudioObserver::new(40, 1000, 20);
        observer.add_stream("brief");

        // Only 5 voiced samples out of the ~50 expected per interval.
        for _ in 0..5 {
            observer.observe("brief", 20);
        }

        assert!(observer.calc().is_empty());
    }

    #[test]
    fn removed_streams_stop_reporting() {
        let observer = AudioObserver::new(40, 1000, 20);
        observer.add_stream("a");
        for _ in 0..50 {
            observer.observe("a", 20);
        }
        observer.remove_stream("a");
        assert!(observer.calc().is_empty());
    }
}
