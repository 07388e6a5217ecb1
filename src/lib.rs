//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
#[macro_use]
extern crate tracing;

pub mod catalog;
pub mod client;
pub mod controller;
pub mod disk;
pub mod error;
pub mod node;
pub mod proto;
pub mod random;
pub mod server;
