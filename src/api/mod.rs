//! REST surface over [`crate::LotTrace`]
//!
//! Routes:
//! - `GET  /api/lots` (`?lot=` single lookup, `?search=` filter)
//! - `GET  /api/lots/:lot_id`
//! - `POST /api/lots`
//! - `POST /api/lots/:lot_id/stages/:stage`
//! - `GET  /api/stages`

pub mod lot_routes;

pub use lot_routes::{create_lot_router, status_for};
