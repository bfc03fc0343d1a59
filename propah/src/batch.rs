//! Path loss from one transmitter to many points.

use crate::{obstruction::LinkGeometry, PathLossModel, PropahError};
use geo::geometry::Coord;
use log::debug;
use rayon::prelude::*;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
use terrain::{ProfileBuffer, TerrainError, TileStore};

/// What happened to one point of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    /// Loss in dB, or the model's unitless result.
    Loss(f64),

    /// The model's lower bound, which already exceeded the
    /// threshold.
    Pruned(f64),

    /// The point could not be evaluated.
    Failed(String),

    /// The batch was cancelled before reaching this point.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[PointOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                PointOutcome::Loss(_) => summary.completed += 1,
                PointOutcome::Pruned(_) => summary.pruned += 1,
                PointOutcome::Failed(_) => summary.failed += 1,
                PointOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary.cancelled = summary.skipped > 0;
        summary
    }
}

/// Settings shared by every point in a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchParams {
    pub tx: Coord<f64>,
    pub tx_height: f64,
    pub rx_height: f64,
    /// Maximum distance between profile samples, in meters.
    pub max_step: f64,
    /// Points whose lower bound exceeds this are not evaluated.
    pub max_loss: Option<f64>,
}

/// Evaluates `model` from `params.tx` to every point, in order.
///
/// `cancel` is checked before each point. Once it is set every
/// remaining point is [`PointOutcome::Skipped`].
pub fn evaluate_points<M>(
    store: &mut TileStore,
    model: &M,
    params: &BatchParams,
    points: &[Coord<f64>],
    cancel: &AtomicBool,
) -> (Vec<PointOutcome>, BatchSummary)
where
    M: PathLossModel + ?Sized,
{
    let now = Instant::now();
    let mut buf = ProfileBuffer::new();
    let outcomes: Vec<PointOutcome> = points
        .iter()
        .map(|point| {
            if cancel.load(Ordering::Relaxed) {
                PointOutcome::Skipped
            } else {
                outcome(evaluate_point(store, &mut buf, model, params, *point))
            }
        })
        .collect();
    let summary = BatchSummary::from_outcomes(&outcomes);
    debug!("batch; {summary:?}, exec: {:?}", now.elapsed());
    (outcomes, summary)
}

/// Same as [`evaluate_points`], spread over the rayon pool with one
/// store per worker from `make_store`.
pub fn evaluate_points_parallel<M, F>(
    make_store: F,
    model: &M,
    params: &BatchParams,
    points: &[Coord<f64>],
    cancel: &AtomicBool,
) -> (Vec<PointOutcome>, BatchSummary)
where
    M: PathLossModel + Sync + ?Sized,
    F: Fn() -> Result<TileStore, TerrainError> + Sync,
{
    let now = Instant::now();
    let outcomes: Vec<PointOutcome> = points
        .par_iter()
        .map_init(
            || (make_store(), ProfileBuffer::new()),
            |(store, buf), point| {
                if cancel.load(Ordering::Relaxed) {
                    return PointOutcome::Skipped;
                }
                match store {
                    Ok(store) => outcome(evaluate_point(store, buf, model, params, *point)),
                    Err(e) => PointOutcome::Failed(format!("no tile store, {e}")),
                }
            },
        )
        .collect();
    let summary = BatchSummary::from_outcomes(&outcomes);
    debug!("parallel batch; {summary:?}, exec: {:?}", now.elapsed());
    (outcomes, summary)
}

fn outcome(result: Result<PointOutcome, PropahError>) -> PointOutcome {
    result.unwrap_or_else(|e| PointOutcome::Failed(e.to_string()))
}

/// Lays out the profile, prunes on the lower bound, and only then
/// looks up terrain.
fn evaluate_point<M>(
    store: &mut TileStore,
    buf: &mut ProfileBuffer,
    model: &M,
    params: &BatchParams,
    point: Coord<f64>,
) -> Result<PointOutcome, PropahError>
where
    M: PathLossModel + ?Sized,
{
    let link = LinkGeometry::new(params.tx_height, params.rx_height);
    store.fill_profile(buf, params.tx, point, params.max_step, false)?;
    let distance = buf.last().map_or(0.0, |sample| sample.m);
    if let (Some(max_loss), Some(bound)) = (params.max_loss, model.lower_bound(distance, &link)) {
        if bound > max_loss {
            return Ok(PointOutcome::Pruned(bound));
        }
    }
    let len = buf.len();
    store.fill_altitudes(buf, len)?;
    Ok(PointOutcome::Loss(model.loss(buf, &link)?))
}
