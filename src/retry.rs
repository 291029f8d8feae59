/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The retry driver: reissue a unit of work until it stops raising
//! `Retry`. Meant to sit at the outermost boundary of each write command,
//! not inside the transaction itself — retrying re-reads everything a
//! closure touched, so it must be idempotent from the caller's view.

use crate::error::{JacquardError, Result};

/// Run `body` until it returns something other than
/// [`JacquardError::Retry`]. Any other error is returned immediately.
pub fn with_retry<F, T>(mut body: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    loop {
        match body() {
            Err(JacquardError::Retry) => {
                log::debug!("retrying after a commit conflict");
                continue;
            }
            other => return other,
        }
    }
}
