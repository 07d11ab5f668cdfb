//! The TLS Alert protocol, used only here to name the error-to-wire mapping
//! the handshake core relies on (§7 of the spec). Sending/encrypting the
//! actual alert record is the record layer's job and out of scope.

use crate::error::Result;
use crate::wire::Reader;

tls_enum_u8!(AlertLevel => {
    warning(1),
    fatal(2),
});

tls_enum_u8!(AlertDescription => {
    close_notify(0),
    unexpected_message(10),
    bad_record_mac(20),
    record_overflow(22),
    handshake_failure(40),
    bad_certificate(42),
    unsupported_certificate(43),
    certificate_revoked(44),
    certificate_expired(45),
    certificate_unknown(46),
    illegal_parameter(47),
    unknown_ca(48),
    access_denied(49),
    decode_error(50),
    decrypt_error(51),
    protocol_version(70),
    insufficient_security(71),
    internal_error(80),
    inappropriate_fallback(86),
    user_canceled(90),
    missing_extension(109),
    unsupported_extension(110),
    unrecognized_name(112),
    bad_certificate_status_response(113),
    unknown_psk_identity(115),
    certificate_required(116),
    no_application_protocol(120),
});

#[derive(Debug, Clone, Copy)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn parse(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            level: AlertLevel::parse(reader)?,
            description: AlertDescription::parse(reader)?,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.level.serialize(out);
        self.description.serialize(out);
    }
}
