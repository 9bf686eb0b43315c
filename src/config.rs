/// Manager-wide tunables consumed by every [`crate::Cep`] it owns.
///
/// Builder-style, matching `flux_network::tcp::TcpConnector`'s `with_*`
/// methods: construct with [`ManagerConfig::default`] and override only what
/// you need.
#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    /// Cap on the private-data payload carried in the handshake frame.
    pub(crate) priv_data_len: usize,
    pub(crate) sockopt_sndbuf: Option<usize>,
    pub(crate) sockopt_rcvbuf: Option<usize>,
    /// Linux `TCP_SYNCNT`; ignored on platforms that don't support it.
    pub(crate) syn_cnt: Option<i32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { priv_data_len: 2048, sockopt_sndbuf: None, sockopt_rcvbuf: None, syn_cnt: None }
    }
}

impl ManagerConfig {
    /// Sets the cap (bytes) on private data carried in a single handshake
    /// frame. Default 2 KiB, matching the manager-configured cap referenced
    /// throughout the CEP's framing rules.
    pub fn with_priv_data_len(mut self, len: usize) -> Self {
        self.priv_data_len = len;
        self
    }

    /// Sets `SO_SNDBUF`/`SO_RCVBUF` on every socket this manager creates or
    /// accepts.
    pub fn with_socket_buf_size(mut self, sndbuf: usize, rcvbuf: usize) -> Self {
        self.sockopt_sndbuf = Some(sndbuf);
        self.sockopt_rcvbuf = Some(rcvbuf);
        self
    }

    /// Sets the number of `SYN` retransmits before a client connect attempt
    /// gives up (Linux `TCP_SYNCNT` sockopt).
    pub fn with_syn_cnt(mut self, syn_cnt: i32) -> Self {
        self.syn_cnt = Some(syn_cnt);
        self
    }

    pub fn priv_data_len(&self) -> usize {
        self.priv_data_len
    }
}
