// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod manager;
pub mod recurring;
pub mod worker;

use std::{future::Future, pin::Pin};

/// Boxed future produced by recurring jobs and workers.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
