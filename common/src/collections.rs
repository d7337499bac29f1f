//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

mod key_sorted_cache;

pub use key_sorted_cache::*;
