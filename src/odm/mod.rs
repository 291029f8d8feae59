/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The object-document layer sitting on top of [`crate::kv`]: typed
//! models, an identity-mapped session, dirty tracking, and a flush that
//! validates before it writes.

pub mod fields;
pub mod session;

pub use session::{read_only_transaction, transaction, GetDefault, Model, Session};
