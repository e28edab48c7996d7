#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Concurrent systems utilities built around three structures that share one
//! discipline: correctness under concurrent access without mutual exclusion
//! on the read path.
//!
//! - [`map::Map`]: a nearly wait-free, resizable hash map. Readers never
//!   block; writers coordinate only through per-slot atomic transitions and
//!   are occasionally drafted into a bounded chunk of cooperative
//!   table-copy work.
//! - [`tiny_lfu::TinyLfu32`] / [`tiny_lfu::TinyLfu64`]: counting-sketch
//!   admission filters answering "is this cache candidate more popular than
//!   its victim?", with safe periodic decay under concurrent readers in the
//!   32-bit variant.
//! - [`state_table::StateTable`]: a keyed registry of shared state objects
//!   whose slots prune themselves when the last holder releases a finished
//!   state.
//!
//! [`bloom`] carries the sizing arithmetic the filters share, and [`sim`]
//! holds eviction-policy scaffolding for studying admission quality.

pub mod bloom;
pub mod map;
pub mod sim;
pub mod state_table;
pub mod tiny_lfu;

pub use map::{DefaultHelper, Map, MapHelper};
pub use state_table::{Params, State, StateHandle, StateTable};
pub use tiny_lfu::{TinyLfu32, TinyLfu64};
