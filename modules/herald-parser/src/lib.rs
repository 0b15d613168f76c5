//! Pure HTML parsing: warmap document → [`herald_common::Snapshot`], and
//! leaderboard profile pages → lifetime realm points.
//!
//! The upstream markup is table soup with no stable ids, so extraction is
//! regex-heuristic. All patterns live in this crate so upstream schema drift
//! is a one-crate change.

mod html;
mod player;
mod timeparse;
mod warmap;

pub use player::parse_realm_points;
pub use timeparse::parse_relative_age;
pub use warmap::parse_warmap;
