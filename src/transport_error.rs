use std::fmt;

use crate::coding::UnexpectedEnd;

/// Transport-level errors occur when a peer violates the protocol specification
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: Code,
    /// Human-readable explanation of the reason
    pub reason: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

impl From<UnexpectedEnd> for TransportError {
    fn from(_: UnexpectedEnd) -> Self {
        TransportError::FRAME_ENCODING_ERROR("unexpected end of frame")
    }
}

/// Transport-level error code
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u64);

impl Code {
    /// Create a QUIC error code from a TLS alert code
    pub fn crypto(code: u8) -> Self {
        Code(0x100 | u64::from(code))
    }
}

impl From<Code> for u64 {
    fn from(x: Code) -> u64 {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:literal;)*} => {
        impl TransportError {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub fn $name<T>(reason: T) -> Self where T: Into<String> {
                    Self {
                        code: Code::$name,
                        reason: reason.into(),
                    }
                }
            )*
        }

        impl Code {
            $(
                #[doc = $desc]
                pub const $name: Self = Code($val);
            )*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => write!(f, "Code::crypto({:02x})", x as u8),
                    x => write!(f, "Code({:x})", x),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($desc),)*
                    // We're trying to be abstract over the crypto protocol, so we can't do
                    // better than this for now.
                    x if (0x100..0x200).contains(&x) => f.write_str("the cryptographic handshake failed"),
                    _ => f.write_str("unknown error"),
                }
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    CONNECTION_REFUSED(0x2) "the server refused to accept a new connection";
    FLOW_CONTROL_ERROR(0x3) "received more data than permitted in advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "received a frame for a stream identifier that exceeded advertised the stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "received a STREAM frame or a RESET_STREAM frame containing a different final size to the one already established";
    FRAME_ENCODING_ERROR(0x7) "received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "received transport parameters that were badly formatted, included an invalid value, omitted a mandatory transport parameter, included a forbidden transport parameter, or were otherwise in error";
    CONNECTION_ID_LIMIT_ERROR(0x9) "the number of connection IDs provided by the peer exceeds the advertised active_connection_id_limit";
    PROTOCOL_VIOLATION(0xA) "detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xB) "received a Retry Token in a client Initial that is invalid";
    APPLICATION_ERROR(0xC) "the application or application protocol caused the connection to be closed during the handshake";
    CRYPTO_BUFFER_EXCEEDED(0xD) "received more data in CRYPTO frames than can be buffered";
    KEY_UPDATE_ERROR(0xE) "key update error";
    AEAD_LIMIT_REACHED(0xF) "the endpoint has reached the confidentiality or integrity limit for the AEAD algorithm";
    NO_VIABLE_PATH(0x10) "no viable network path exists";
    VERSION_NEGOTIATION_ERROR(0x11) "version negotiation was tampered with or produced an inconsistent result";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_display() {
        assert_eq!(format!("{:?}", Code::PROTOCOL_VIOLATION), "PROTOCOL_VIOLATION");
        assert_eq!(format!("{:?}", Code::crypto(0x32)), "Code::crypto(32)");
        let err = TransportError::FRAME_ENCODING_ERROR("negative packet number");
        assert_eq!(
            err.to_string(),
            "received a frame that was badly formatted: negative packet number"
        );
    }
}
