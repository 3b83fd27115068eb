// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::work::ServerId;

/// Receives cluster membership changes for the servers sharing a work queue.
pub trait ClusterListener: Send + Sync {
    fn on_server_joined(&self, servers: &[ServerId]);

    /// Called when `servers` have left the cluster (shut down or presumed
    /// dead). Any work they had leased must become claimable again.
    fn on_server_left(&self, servers: &[ServerId]);
}
