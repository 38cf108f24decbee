//! Background discovery of chunks entering and leaving the view footprint

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::streaming::CancelToken;
use crate::terrain::ChunkCoord;

/// Viewpoint as published by the frame loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewState {
    /// Chunk containing the viewpoint
    pub coord: ChunkCoord,
    /// Bumped to force a full rediscovery without moving
    pub epoch: u64,
}

/// Coordinates within `render_distance` chunks of `center`, nearest first
pub fn footprint(center: ChunkCoord, render_distance: u32) -> Vec<ChunkCoord> {
    let rd = render_distance as i32;
    let mut coords = Vec::with_capacity(((2 * rd + 1) * (2 * rd + 1)) as usize);
    for dz in -rd..=rd {
        for dx in -rd..=rd {
            coords.push(center.offset(dx, dz));
        }
    }
    coords.sort_by_key(|c| c.chebyshev_distance(&center));
    coords
}

/// Chunks kept beyond the render distance before deactivating
pub const RETAIN_SLACK: u32 = 1;

/// Whether `coord` stays loaded for a viewpoint in `center`.
///
/// The retained square is the footprint padded by [`RETAIN_SLACK`], so a
/// viewpoint moving back and forth across one chunk boundary releases nothing.
pub fn is_retained(center: ChunkCoord, coord: ChunkCoord, render_distance: u32) -> bool {
    center.chebyshev_distance(&coord) <= render_distance + RETAIN_SLACK
}

/// Periodically diffs the footprint against the active set.
///
/// Reads a shared snapshot of active coordinates and only ever writes into
/// the activation and deactivation channels.
pub struct DiscoveryLoop {
    view_rx: watch::Receiver<Option<ViewState>>,
    active: Arc<RwLock<HashSet<ChunkCoord>>>,
    activate_tx: mpsc::UnboundedSender<ChunkCoord>,
    deactivate_tx: mpsc::UnboundedSender<ChunkCoord>,
    render_distance: u32,
    interval: Duration,
    cancel: CancelToken,
    last: Option<ViewState>,
}

impl DiscoveryLoop {
    pub fn new(
        view_rx: watch::Receiver<Option<ViewState>>,
        active: Arc<RwLock<HashSet<ChunkCoord>>>,
        activate_tx: mpsc::UnboundedSender<ChunkCoord>,
        deactivate_tx: mpsc::UnboundedSender<ChunkCoord>,
        render_distance: u32,
        interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            view_rx,
            active,
            activate_tx,
            deactivate_tx,
            render_distance,
            interval,
            cancel,
            last: None,
        }
    }

    /// Run one discovery pass, returning whether the view had changed
    pub fn pass(&mut self) -> bool {
        let Some(view) = *self.view_rx.borrow_and_update() else {
            return false;
        };
        if self.last == Some(view) {
            return false;
        }
        self.last = Some(view);

        let active = match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut activations = 0;
        for coord in footprint(view.coord, self.render_distance) {
            if !active.contains(&coord) && self.activate_tx.send(coord).is_ok() {
                activations += 1;
            }
        }

        let mut deactivations = 0;
        for &coord in &active {
            if !is_retained(view.coord, coord, self.render_distance) && self.deactivate_tx.send(coord).is_ok() {
                deactivations += 1;
            }
        }

        log::debug!(
            "Discovery around {}: {} to activate, {} to deactivate",
            view.coord,
            activations,
            deactivations
        );
        true
    }

    /// Poll until cancelled
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.view_rx.changed() => {
                    // Wake early only to notice cancellation
                    if changed.is_err() || self.cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.pass();
        }
        log::debug!("Discovery loop stopped");
    }
}
