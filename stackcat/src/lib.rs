// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Composable transport layer stacks over TCP
//!
//! Endpoints are written as `layer+layer://host:port?layer.key=value`; each layer names a
//! [driver](common::driver::Driver) in a [registry](common::driver::registry::DriverRegistry),
//! and a [pipeline](common::pipeline::Pipeline) composes the built layers into a dialer or
//! listener. A [tunnel](common::tunnel::Tunnel) relays sessions between two such endpoints.

pub mod common;
pub mod drivers;
pub mod util;
