// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the pieces of the virtual machine convergence
//! controller: the declared and observed resource types it reads from the
//! control-plane store, the error type used across component boundaries, and
//! retry policies.

pub mod api;
pub mod backoff;
