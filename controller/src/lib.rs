// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keeps declared virtual machines converged with the machines running on a
//! remote virtualization backend.
//!
//! The entry point is [`reconciler::VirtualMachineReconciler`], driven by a
//! [`queue::Controller`].  Each pass borrows a backend connection from the
//! [`session::SessionCache`], asks the backend for placement through
//! [`placement`] when it has to create a machine, and drives volume
//! attachment objects through [`volumes::VolumeOrchestrator`].

pub mod backend;
pub mod config;
pub mod infra;
pub mod placement;
pub mod prereqs;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod sim;
pub mod store;
pub mod task;
pub mod vm;
pub mod volumes;
