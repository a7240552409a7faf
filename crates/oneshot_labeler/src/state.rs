/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use oneshot_core::blocklist::BlockList;
use oneshot_core::config::Config;
use oneshot_core::identity::IdentityDirectory;
use oneshot_core::jetstream::JetstreamListener;
use oneshot_core::keys::ServerKeys;
use oneshot_core::notifier::BlockNotifier;
use oneshot_core::store::Store;

/// Collaborators handed to every route handler. Everything is constructed
/// once at startup; no hidden globals.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Store,
    pub notifier: Arc<BlockNotifier>,
    pub keys: Arc<ServerKeys>,
    pub directory: IdentityDirectory,
    pub block_list: Arc<BlockList>,
    pub jetstream: Arc<JetstreamListener>,
}
