// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource types and errors exchanged with the control-plane store.

mod condition;
mod error;
mod machine;

pub use condition::*;
pub use error::*;
pub use machine::*;
