//! # Radio Frequency Propogation
//!
//! `propah` turns terrain profiles into path loss. The
//! [`obstruction`] module finds the points that block the sight line
//! between two antennas, [`model`] turns those features into a loss,
//! and [`batch`] runs a model against many receiver locations.

pub mod batch;
mod error;
pub mod links;
pub mod model;
pub mod obstruction;

pub use {
    crate::{
        error::PropahError,
        model::{LosModel, PathLossModel, RegressionCoefficients, RegressionModel},
        obstruction::{
            classify, fresnel_search, sight_line_clear, LinkGeometry, Obstruction,
            ObstructionAnalysis, SearchGeometry,
        },
    },
    geo, terrain,
};
