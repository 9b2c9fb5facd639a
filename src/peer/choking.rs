/// The four choke/interest flags of a connection.
///
/// Every connection starts choked and uninterested in both directions; the
/// flags only move in response to protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    /// We are refusing the remote's requests.
    pub am_choking: bool,
    /// We want pieces the remote has.
    pub am_interested: bool,
    /// The remote is refusing our requests.
    pub peer_choking: bool,
    /// The remote wants pieces we have.
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ChokingState {
    /// The remote may request from us.
    pub fn can_upload(&self) -> bool {
        self.peer_interested && !self.am_choking
    }

    /// We may request from the remote.
    pub fn can_download(&self) -> bool {
        self.am_interested && !self.peer_choking
    }
}
