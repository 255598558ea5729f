// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Why a socket operation stopped, classified so the read/write loops can
/// map it onto the right close reason.
#[derive(Debug)]
pub(crate) enum IoFailure {
    Cancelled,
    TimedOut,
    Eof,
    Io(std::io::Error),
}

pub(crate) async fn io_with_timeout<F, T>(
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, IoFailure>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(IoFailure::Cancelled),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(IoFailure::Eof)
                },
                Ok(Err(e)) => Err(IoFailure::Io(e)),
                Err(_) => Err(IoFailure::TimedOut),
            }
        }
    }
}
