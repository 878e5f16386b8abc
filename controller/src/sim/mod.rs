// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the virtualization backend and the control-plane
//! store

mod backend;
pub mod fixtures;
mod store;

pub use backend::SimBackend;
pub use backend::SimCall;
pub use backend::SimCounters;
pub use store::SimStore;
pub use store::SimStoreCounters;
