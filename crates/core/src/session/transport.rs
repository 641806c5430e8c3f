use std::net::SocketAddr;

/// Transport negotiated for one session during SETUP (RFC 2326 §12.39).
///
/// ```text
/// C->S  Transport: RTP/AVP;unicast;client_port=8000-8001
/// S->C  Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
#[derive(Debug, Clone)]
pub struct Transport {
    pub client_rtp_port: u16,
    pub client_rtcp_port: u16,
    pub server_rtp_port: u16,
    pub server_rtcp_port: u16,
    /// Where RTP for this session is sent (`client_ip:client_rtp_port`).
    pub client_addr: SocketAddr,
}

impl Transport {
    /// Value for the `Transport` header of the SETUP response.
    pub fn header_value(&self) -> String {
        format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
            self.client_rtp_port, self.client_rtcp_port, self.server_rtp_port, self.server_rtcp_port
        )
    }
}

/// What the client asked for in its `Transport` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    /// `RTP/AVP[/UDP];unicast;client_port=a-b`
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// `RTP/AVP/TCP;interleaved=a-b`, not served.
    Interleaved,
    /// `multicast`, not served.
    Multicast,
}

impl TransportRequest {
    /// Parse a `Transport` header value.
    ///
    /// Clients may list several alternatives separated by commas; the first
    /// UDP unicast one wins, otherwise the first recognised one is reported.
    ///
    /// ```
    /// use livecam::session::transport::TransportRequest;
    ///
    /// let t = TransportRequest::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(t, TransportRequest::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 });
    /// assert!(TransportRequest::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let options: Vec<Self> = header.split(',').filter_map(Self::parse_one).collect();
        options
            .iter()
            .find(|t| matches!(t, Self::Udp { .. }))
            .or_else(|| options.first())
            .cloned()
    }

    fn parse_one(spec: &str) -> Option<Self> {
        let mut params = spec.split(';').map(str::trim);
        let protocol = params.next()?;
        let params: Vec<&str> = params.collect();

        if protocol.eq_ignore_ascii_case("RTP/AVP/TCP")
            || params.iter().any(|p| p.starts_with("interleaved="))
        {
            return Some(Self::Interleaved);
        }
        if params.iter().any(|p| p.eq_ignore_ascii_case("multicast")) {
            return Some(Self::Multicast);
        }

        let ports = params.iter().find_map(|p| p.strip_prefix("client_port="))?;
        let (rtp, rtcp) = match ports.split_once('-') {
            Some((rtp, rtcp)) => (rtp.parse().ok()?, rtcp.parse().ok()?),
            None => {
                let rtp: u16 = ports.parse().ok()?;
                (rtp, rtp.checked_add(1)?)
            }
        };

        Some(Self::Udp {
            client_rtp_port: rtp,
            client_rtcp_port: rtcp,
        })
    }
}
