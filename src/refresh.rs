/// The refresh module keeps smart playlists up to date while the library changes underneath them.
///
/// Library events are queued to a background worker. The worker waits until the library has been
/// quiet for the configured debounce window, merges everything it received into one batch, and
/// re-evaluates the affected playlists in a single pass. Every event bumps a generation counter; a
/// pass that sees a newer generation stops without publishing and its batch is folded into the
/// next one, so only the latest request ever reaches the sink.
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::common::uniq;
use crate::config::Config;
use crate::error::Result;
use crate::library::{list_tracks, list_tracks_by_id};
use crate::playlists::{evaluate_smart_playlist, filter_pool, list_smart_playlists, reevaluate_smart_playlist, smart_playlist_track_ids, store_smart_playlist_tracks};
use crate::rules::RuleEngine;
use crate::tracks::{Track, TrackId};

/// Receives the new membership of every refreshed smart playlist. Called on the refresh worker
/// thread.
pub trait RefreshSink: Send + 'static {
    fn playlist_refreshed(&self, name: &str, track_ids: &[TrackId]);
}

impl<F> RefreshSink for F
where
    F: Fn(&str, &[TrackId]) + Send + 'static,
{
    fn playlist_refreshed(&self, name: &str, track_ids: &[TrackId]) {
        self(name, track_ids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    /// Tracks were imported, edited or re-analyzed.
    TracksChanged(Vec<TrackId>),
    TracksRemoved(Vec<TrackId>),
    /// A playlist's rules or settings were edited outside of this scheduler.
    PlaylistChanged(String),
    /// The user asked for a playlist to be refreshed, auto or not.
    RefreshRequested(String),
    RefreshAll,
}

enum Message {
    Event(LibraryEvent),
    Shutdown,
}

/// Everything that happened since the last completed pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PendingBatch {
    pub(crate) changed: BTreeSet<TrackId>,
    pub(crate) removed: BTreeSet<TrackId>,
    /// Playlists that need a full re-evaluation.
    pub(crate) playlists: BTreeSet<String>,
    pub(crate) refresh_all: bool,
}

impl PendingBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.playlists.is_empty() && !self.refresh_all
    }

    /// Adds an event. The latest event about a track wins: a track that is changed after being
    /// removed was re-imported, and vice versa.
    pub(crate) fn add(&mut self, event: LibraryEvent) {
        match event {
            LibraryEvent::TracksChanged(ids) => {
                for id in ids {
                    self.removed.remove(&id);
                    self.changed.insert(id);
                }
            }
            LibraryEvent::TracksRemoved(ids) => {
                for id in ids {
                    self.changed.remove(&id);
                    self.removed.insert(id);
                }
            }
            LibraryEvent::PlaylistChanged(name) | LibraryEvent::RefreshRequested(name) => {
                self.playlists.insert(name);
            }
            LibraryEvent::RefreshAll => self.refresh_all = true,
        }
    }

    /// Folds an abandoned older batch into this one. Events in `self` are newer and win.
    pub(crate) fn merge_older(&mut self, older: PendingBatch) {
        for id in older.changed {
            if !self.removed.contains(&id) {
                self.changed.insert(id);
            }
        }
        for id in older.removed {
            if !self.changed.contains(&id) {
                self.removed.insert(id);
            }
        }
        self.playlists.extend(older.playlists);
        self.refresh_all |= older.refresh_all;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassOutcome {
    Completed,
    Superseded,
}

pub struct RefreshScheduler {
    sender: Option<Sender<Message>>,
    generation: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn start(c: Config, sink: impl RefreshSink) -> Result<RefreshScheduler> {
        let (sender, receiver) = channel();
        let generation = Arc::new(AtomicU64::new(0));
        let worker_generation = Arc::clone(&generation);
        let handle = thread::Builder::new()
            .name("smartlist-refresh".to_string())
            .spawn(move || run_worker(c, receiver, worker_generation, sink))?;
        info!("Started smart playlist refresh worker");
        Ok(RefreshScheduler {
            sender: Some(sender),
            generation,
            handle: Some(handle),
        })
    }

    /// Queues a library event. Any pass in flight is superseded.
    pub fn notify(&self, event: LibraryEvent) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(sender) = &self.sender else {
            return;
        };
        debug!("Queueing library event {:?}", event);
        if sender.send(Message::Event(event)).is_err() {
            warn!("Smart playlist refresh worker is gone, dropping library event");
        }
    }

    /// Flushes pending events, then stops the worker and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Message::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Smart playlist refresh worker panicked");
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How many times a failed pass is retried before its batch is dropped.
const MAX_PASS_RETRIES: u32 = 3;

fn run_worker(c: Config, receiver: Receiver<Message>, generation: Arc<AtomicU64>, sink: impl RefreshSink) {
    let mut pending = PendingBatch::default();
    let mut failures: u32 = 0;
    loop {
        // Block until there is something to do, then keep collecting until the library is quiet.
        // After a failed pass, wait twice as long before each retry.
        let message = if pending.is_empty() {
            receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            receiver.recv_timeout(c.refresh_debounce() * 2u32.pow(failures))
        };
        match message {
            Ok(Message::Event(event)) => pending.add(event),
            Err(RecvTimeoutError::Timeout) => {
                let batch = std::mem::take(&mut pending);
                let started_at = generation.load(Ordering::SeqCst);
                let is_stale = || generation.load(Ordering::SeqCst) != started_at;
                match run_pass(&c, &batch, &sink, &is_stale) {
                    Ok(PassOutcome::Completed) => failures = 0,
                    Ok(PassOutcome::Superseded) => {
                        debug!("Refresh pass superseded by a newer request, merging it into the next batch");
                        pending.merge_older(batch);
                    }
                    Err(e) if failures < MAX_PASS_RETRIES => {
                        failures += 1;
                        warn!("Failed to refresh smart playlists (attempt {}), retrying: {}", failures, e);
                        pending.merge_older(batch);
                    }
                    Err(e) => {
                        error!("Failed to refresh smart playlists after {} retries, dropping batch {:?}: {}", failures, batch, e);
                        failures = 0;
                    }
                }
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if !pending.is_empty() {
                    debug!("Flushing pending refresh batch before shutdown");
                    if let Err(e) = run_pass(&c, &pending, &sink, &|| false) {
                        error!("Failed to refresh smart playlists: {}", e);
                    }
                }
                info!("Stopped smart playlist refresh worker");
                return;
            }
        }
    }
}

/// Re-evaluates every playlist the batch affects. Explicitly named playlists, playlists whose
/// previous membership is unknown or truncated, and playlists with time-relative rules get a full
/// pass; auto playlists are otherwise patched incrementally from the changed tracks.
///
/// Staleness is checked before each playlist is stored and again before it is published, so a
/// superseded pass never reaches the sink. A playlist stored just before the pass went stale is
/// overwritten by the next pass.
pub(crate) fn run_pass(c: &Config, batch: &PendingBatch, sink: &impl RefreshSink, is_stale: &(dyn Fn() -> bool + Sync)) -> Result<PassOutcome> {
    let changed_ids: Vec<TrackId> = batch.changed.iter().copied().collect();
    let changed = list_tracks_by_id(c, &changed_ids)?;
    // Changed tracks that are gone by now count as removed.
    let present: HashSet<TrackId> = changed.iter().map(|t| t.id).collect();
    let removed: Vec<TrackId> = uniq(batch.removed.iter().copied().chain(changed_ids.iter().copied().filter(|id| !present.contains(id))).collect());
    let tracks_touched = !changed.is_empty() || !removed.is_empty();

    let engine = RuleEngine::new();
    let mut library: Option<(Vec<Track>, Option<ThreadPool>)> = None;
    let mut refreshed = 0;
    for playlist in list_smart_playlists(c)? {
        if is_stale() {
            return Ok(PassOutcome::Superseded);
        }
        let explicit = batch.refresh_all || batch.playlists.contains(&playlist.name);
        if !explicit && !(playlist.auto_refresh && tracks_touched) {
            continue;
        }

        let incremental = if explicit || playlist.refreshed_at.is_none() {
            None
        } else {
            let previous = smart_playlist_track_ids(c, &playlist.name)?;
            reevaluate_smart_playlist(&engine, &playlist, &previous, &changed, &removed)
        };
        let ids = match incremental {
            Some(ids) => ids,
            None => {
                if library.is_none() {
                    let tracks = list_tracks(c)?;
                    let pool = filter_pool(c, tracks.len())?;
                    library = Some((tracks, pool));
                }
                let (tracks, pool) = match &library {
                    Some((tracks, pool)) => (tracks.as_slice(), pool.as_ref()),
                    None => (&[][..], None),
                };
                match evaluate_smart_playlist(&engine, &playlist, tracks, pool, is_stale)? {
                    Some(ids) => ids,
                    None => return Ok(PassOutcome::Superseded),
                }
            }
        };

        if is_stale() {
            return Ok(PassOutcome::Superseded);
        }
        store_smart_playlist_tracks(c, &playlist.name, &ids)?;
        if is_stale() {
            return Ok(PassOutcome::Superseded);
        }
        sink.playlist_refreshed(&playlist.name, &ids);
        refreshed += 1;
    }
    info!(
        "Refreshed {} smart playlists after {} changed and {} removed tracks",
        refreshed,
        changed.len(),
        removed.len()
    );
    Ok(PassOutcome::Completed)
}
