//! Linking of repeated detections of one emitter into tracks.
//!
//! Frames are consumed in strictly increasing order. Each open track remembers
//! its last position and frame. A new frame's localizations are matched to open
//! tracks within `max_linking_distance_px` by greedy nearest-neighbor assignment:
//! candidate pairs are sorted by distance, then track id, then localization
//! order, and taken while both sides are free. Leftover localizations open new
//! tracks. A track closes once its gap would exceed `max_frame_gap`.
//!
//! The linker owns all open-track state and runs on a single thread.


use glam::DVec2;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::localization::Localization;

/// Smallest uncertainty used as an inverse-variance weight.
const MIN_PRECISION: f64 = 1e-6;

/// One emitter followed across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Creation order, starting at 0.
    pub id: usize,
    /// Indices into the linked localization slice, in increasing frame order.
    pub members: Vec<usize>,
    /// Inverse-variance weighted position.
    pub x: f64,
    pub y: f64,
    /// Combined uncertainty `1 / sqrt(Σ 1/lp²)`.
    pub lpx: f64,
    pub lpy: f64,
    /// Total photons over all members.
    pub photons: f64,
    /// Mean background of the members.
    pub background: f64,
    pub first_frame: usize,
    pub last_frame: usize,
}

impl Track {
    /// Aggregate `members` of `localizations` into a track.
    pub fn from_members(id: usize, members: Vec<usize>, localizations: &[Localization]) -> Self {
        let mut wx_sum = 0.0;
        let mut wy_sum = 0.0;
        let mut x_sum = 0.0;
        let mut y_sum = 0.0;
        let mut photons = 0.0;
        let mut background = 0.0;
        let mut first_frame = usize::MAX;
        let mut last_frame = 0;

        for &index in &members {
            let loc = &localizations[index];
            let wx = 1.0 / (loc.lpx as f64).max(MIN_PRECISION).powi(2);
            let wy = 1.0 / (loc.lpy as f64).max(MIN_PRECISION).powi(2);
            wx_sum += wx;
            wy_sum += wy;
            x_sum += wx * loc.x as f64;
            y_sum += wy * loc.y as f64;
            photons += loc.photons as f64;
            background += loc.background as f64;
            first_frame = first_frame.min(loc.frame);
            last_frame = last_frame.max(loc.frame);
        }

        let count = members.len().max(1) as f64;
        Self {
            id,
            x: x_sum / wx_sum,
            y: y_sum / wy_sum,
            lpx: 1.0 / wx_sum.sqrt(),
            lpy: 1.0 / wy_sum.sqrt(),
            photons,
            background: background / count,
            first_frame,
            last_frame,
            members,
        }
    }

    /// Same membership aggregated over another localization set with the same
    /// indexing, e.g. after drift correction.
    pub fn reaggregate(&self, localizations: &[Localization]) -> Self {
        Self::from_members(self.id, self.members.clone(), localizations)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Frames from first to last, inclusive.
    #[inline]
    pub fn frame_span(&self) -> usize {
        self.last_frame - self.first_frame + 1
    }

    pub fn position(&self) -> DVec2 {
        DVec2::new(self.x, self.y)
    }

    pub fn localizations<'a>(
        &'a self,
        localizations: &'a [Localization],
    ) -> impl Iterator<Item = &'a Localization> + 'a {
        self.members.iter().map(move |&i| &localizations[i])
    }

    pub fn frames(&self, localizations: &[Localization]) -> Vec<usize> {
        self.localizations(localizations).map(|l| l.frame).collect()
    }
}

#[derive(Debug)]
struct OpenTrack {
    id: usize,
    members: Vec<usize>,
    position: DVec2,
    last_frame: usize,
}

#[derive(Debug, Clone, Copy)]
struct LinkPair {
    distance: f64,
    track_id: usize,
    /// Position of the localization within the pushed frame.
    order: usize,
    /// Index into the open-track list.
    slot: usize,
}

/// Incremental frame-by-frame linker.
#[derive(Debug)]
pub struct Linker {
    max_distance: f64,
    max_gap: usize,
    open: Vec<OpenTrack>,
    closed: Vec<(usize, Vec<usize>)>,
    next_id: usize,
    last_pushed: Option<usize>,
}

impl Linker {
    pub fn new(config: &Config) -> Self {
        Self {
            max_distance: config.max_linking_distance_px,
            max_gap: config.max_frame_gap,
            open: Vec::new(),
            closed: Vec::new(),
            next_id: 0,
            last_pushed: None,
        }
    }

    /// Number of tracks created so far.
    pub fn track_count(&self) -> usize {
        self.next_id
    }

    /// Link the localizations of `frame`, given as `(index, localization)`.
    ///
    /// # Panics
    /// If `frame` is not greater than the previously pushed frame.
    pub fn push_frame<'a, I>(&mut self, frame: usize, members: I)
    where
        I: IntoIterator<Item = (usize, &'a Localization)>,
    {
        if let Some(last) = self.last_pushed {
            assert!(
                frame > last,
                "frames must be pushed in increasing order: {frame} after {last}"
            );
        }
        self.last_pushed = Some(frame);

        self.close_stale(frame);

        let incoming: Vec<(usize, DVec2)> = members
            .into_iter()
            .map(|(index, loc)| (index, DVec2::new(loc.x as f64, loc.y as f64)))
            .collect();
        if incoming.is_empty() {
            return;
        }

        let pairs = self.candidate_pairs(&incoming);

        let mut track_taken = vec![false; self.open.len()];
        let mut loc_taken = vec![false; incoming.len()];
        for pair in pairs {
            if track_taken[pair.slot] || loc_taken[pair.order] {
                continue;
            }
            track_taken[pair.slot] = true;
            loc_taken[pair.order] = true;

            let (index, position) = incoming[pair.order];
            let track = &mut self.open[pair.slot];
            track.members.push(index);
            track.position = position;
            track.last_frame = frame;
        }

        for (&(index, position), _) in incoming.iter().zip(&loc_taken).filter(|(_, t)| !**t) {
            self.open.push(OpenTrack {
                id: self.next_id,
                members: vec![index],
                position,
                last_frame: frame,
            });
            self.next_id += 1;
        }
    }

    /// Close remaining tracks and aggregate every track over `localizations`,
    /// ordered by id.
    pub fn finish(mut self, localizations: &[Localization]) -> Vec<Track> {
        self.closed
            .extend(self.open.drain(..).map(|track| (track.id, track.members)));
        self.closed.sort_unstable_by_key(|(id, _)| *id);

        self.closed
            .into_iter()
            .map(|(id, members)| Track::from_members(id, members, localizations))
            .collect()
    }

    fn close_stale(&mut self, frame: usize) {
        let max_gap = self.max_gap;
        let (stale, open): (Vec<OpenTrack>, Vec<OpenTrack>) = self
            .open
            .drain(..)
            .partition(|track| frame - track.last_frame - 1 > max_gap);
        self.open = open;
        self.closed
            .extend(stale.into_iter().map(|track| (track.id, track.members)));
    }

    /// All (open track, localization) pairs within the linking distance, in
    /// assignment order.
    fn candidate_pairs(&self, incoming: &[(usize, DVec2)]) -> Vec<LinkPair> {
        let cell_size = self.max_distance.max(f64::MIN_POSITIVE);
        let cell_of = |p: DVec2| {
            (
                (p.x / cell_size).floor() as i64,
                (p.y / cell_size).floor() as i64,
            )
        };

        let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (slot, track) in self.open.iter().enumerate() {
            grid.entry(cell_of(track.position)).or_default().push(slot);
        }

        let mut pairs = Vec::new();
        for (order, &(_, position)) in incoming.iter().enumerate() {
            let (cx, cy) = cell_of(position);
            for gy in (cy - 1)..=(cy + 1) {
                for gx in (cx - 1)..=(cx + 1) {
                    let Some(slots) = grid.get(&(gx, gy)) else {
                        continue;
                    };
                    for &slot in slots {
                        let track = &self.open[slot];
                        let distance = track.position.distance(position);
                        if distance <= self.max_distance {
                            pairs.push(LinkPair {
                                distance,
                                track_id: track.id,
                                order,
                                slot,
                            });
                        }
                    }
                }
            }
        }

        pairs.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.track_id.cmp(&b.track_id))
                .then(a.order.cmp(&b.order))
        });
        pairs
    }
}

/// Link a complete localization set. Input order is irrelevant; localizations
/// are grouped by frame with a stable sort.
pub fn link(localizations: &[Localization], config: &Config) -> Vec<Track> {
    let mut order: Vec<usize> = (0..localizations.len()).collect();
    order.sort_by_key(|&i| localizations[i].frame);

    let mut linker = Linker::new(config);
    for group in order.chunk_by(|&a, &b| localizations[a].frame == localizations[b].frame) {
        let frame = localizations[group[0]].frame;
        linker.push_frame(frame, group.iter().map(|&i| (i, &localizations[i])));
    }

    let tracks = linker.finish(localizations);
    tracing::debug!(
        localizations = localizations.len(),
        tracks = tracks.len(),
        "linking done"
    );
    tracks
}
