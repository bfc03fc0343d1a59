//! Terrain elevation served from fixed-size raster tiles.
//!
//! A [`TileStore`] owns a [`BoundedCache`] of decoded tiles and pulls
//! missing ones through a [`Resolver`], which either points at a
//! directory of GeoTIFFs or downloads them from a map service.
//! Profiles between two points are written into a caller-owned
//! [`ProfileBuffer`] so the same storage can be reused across
//! queries.

pub mod cache;
mod error;
pub mod http;
pub mod resolve;
mod sample;
mod store;

pub use crate::{
    cache::{BoundedCache, CacheStats},
    error::TerrainError,
    http::{HttpClient, ReqwestClient},
    resolve::{RemoteTiles, Resolver, RetryPolicy},
    sample::{ElevationSample, ProfileBuffer},
    store::{
        tile_key, SharedTileStore, TileKey, TileMode, TileStats, TileStore, TileStoreBuilder,
    },
};
pub use elevation::{self, Elev, Tile, C};
