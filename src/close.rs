//! Close status codes, RFC 6455 section 7.4.

/// Status code carried in the first two bytes of a close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away (server shutdown, idle timeout).
    Away,
    /// 1002, protocol error.
    Protocol,
    /// 1003, received a type of data the endpoint cannot accept.
    Unsupported,
    /// 1005, reserved: no status code was present. Never sent on the wire.
    Status,
    /// 1006, reserved: the connection closed without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007, payload data inconsistent with the message type (e.g. non UTF-8 text).
    Invalid,
    /// 1008, policy violation.
    Policy,
    /// 1009, message too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    Extension,
    /// 1011, unexpected condition on the server.
    Error,
    /// 1012, the server is restarting.
    Restart,
    /// 1013, try again later.
    Again,
    /// 1015, reserved: TLS handshake failure. Never sent on the wire.
    Tls,
    /// Codes in 1016..=2999 that the protocol has not assigned.
    Reserved(u16),
    /// 3000..=3999, registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000..=4999, private use by applications.
    Library(u16),
    /// Anything below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may appear in a close frame sent by a peer.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1..=999 => CloseCode::Bad(code),
            1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            // 1004, 1014 and everything else left unassigned
            1004 | 1014 => CloseCode::Reserved(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}
