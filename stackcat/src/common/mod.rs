// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod driver;
pub mod pipeline;
pub mod tunnel;
