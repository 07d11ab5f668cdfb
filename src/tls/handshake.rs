//! The TLS 1.3 handshake message layer: `{type, uint24 length, body}`
//! framing plus the typed body for every message the state machine (C8)
//! sends or receives.

use bytes::Bytes;

use crate::credentials::CertificateChain;
use crate::error::{illegal_parameter, Result};
use crate::tls::cipher_suite::CipherSuite;
use crate::tls::extensions::{
    parse_extension_list, serialize_extension_list, Extension, HandshakeMessageKind,
    SignatureScheme,
};
use crate::wire::{serialize_varlen_vector, Reader};

tls_enum_u8!(HandshakeType => {
    client_hello(1),
    server_hello(2),
    new_session_ticket(4),
    end_of_early_data(5),
    encrypted_extensions(8),
    certificate(11),
    certificate_request(13),
    certificate_verify(15),
    finished(20),
    key_update(24),
    message_hash(254),
});

pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8, 0x91,
    0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8, 0x33, 0x9C,
];

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub legacy_session_id: Bytes,
    pub cipher_suites: Vec<CipherSuite>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let legacy_version = reader.u16()?;
        let random = {
            let b = reader.take(32)?;
            let mut r = [0u8; 32];
            r.copy_from_slice(b);
            r
        };
        let legacy_session_id = reader.varlen_vector(0, 32)?;

        let mut cipher_suites = vec![];
        {
            let mut cs_reader = reader.vector_reader(2, crate::wire::U16_LIMIT - 1)?;
            while !cs_reader.is_empty() {
                cipher_suites.push(CipherSuite::parse(&mut cs_reader)?);
            }
        }

        let legacy_compression_methods = reader.varlen_vector(1, crate::wire::U8_LIMIT)?;
        if legacy_compression_methods.as_ref() != [0u8] {
            return Err(illegal_parameter("Bad legacy_compression_methods"));
        }

        let extensions = parse_extension_list(reader, HandshakeMessageKind::ClientHello)?;

        Ok(Self {
            legacy_version,
            random,
            legacy_session_id,
            cipher_suites,
            extensions,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.legacy_version.to_be_bytes());
        out.extend_from_slice(&self.random);
        serialize_varlen_vector(0, 32, out, |out| {
            out.extend_from_slice(&self.legacy_session_id)
        });
        serialize_varlen_vector(2, crate::wire::U16_LIMIT - 1, out, |out| {
            for cs in &self.cipher_suites {
                cs.serialize(out);
            }
        });
        serialize_varlen_vector(1, crate::wire::U8_LIMIT, out, |out| out.push(0));
        serialize_extension_list(&self.extensions, out);
    }
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub legacy_session_id_echo: Bytes,
    pub cipher_suite: CipherSuite,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }

    fn parse(reader: &mut Reader) -> Result<Self> {
        let legacy_version = reader.u16()?;
        let random = {
            let b = reader.take(32)?;
            let mut r = [0u8; 32];
            r.copy_from_slice(b);
            r
        };
        let legacy_session_id_echo = reader.varlen_vector(0, 32)?;
        let cipher_suite = CipherSuite::parse(reader)?;
        let legacy_compression_method = reader.u8()?;
        if legacy_compression_method != 0 {
            return Err(illegal_parameter("Bad legacy_compression_method"));
        }

        let kind = if random == HELLO_RETRY_REQUEST_RANDOM {
            HandshakeMessageKind::HelloRetryRequest
        } else {
            HandshakeMessageKind::ServerHello
        };
        let extensions = parse_extension_list(reader, kind)?;

        Ok(Self {
            legacy_version,
            random,
            legacy_session_id_echo,
            cipher_suite,
            extensions,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.legacy_version.to_be_bytes());
        out.extend_from_slice(&self.random);
        serialize_varlen_vector(0, 32, out, |out| {
            out.extend_from_slice(&self.legacy_session_id_echo)
        });
        self.cipher_suite.serialize(out);
        out.push(0);
        serialize_extension_list(&self.extensions, out);
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

impl EncryptedExtensions {
    fn parse(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            extensions: parse_extension_list(reader, HandshakeMessageKind::EncryptedExtensions)?,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        serialize_extension_list(&self.extensions, out);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CertificateRequest {
    /// Empty during the initial handshake; a fresh random value during
    /// post-handshake re-authentication.
    pub certificate_request_context: Bytes,
    pub extensions: Vec<Extension>,
}

impl CertificateRequest {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let certificate_request_context = reader.varlen_vector(0, crate::wire::U8_LIMIT)?;
        let extensions = parse_extension_list(reader, HandshakeMessageKind::CertificateRequest)?;
        Ok(Self {
            certificate_request_context,
            extensions,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, crate::wire::U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_request_context)
        });
        serialize_extension_list(&self.extensions, out);
    }
}

#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub data: Bytes,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, Default)]
pub struct Certificate {
    pub certificate_request_context: Bytes,
    pub certificate_list: Vec<CertificateEntry>,
}

impl Certificate {
    pub fn chain(&self) -> CertificateChain {
        CertificateChain(self.certificate_list.iter().map(|e| e.data.clone()).collect())
    }

    fn parse(reader: &mut Reader) -> Result<Self> {
        let certificate_request_context = reader.varlen_vector(0, crate::wire::U8_LIMIT)?;

        let mut certificate_list = vec![];
        let mut list_reader = reader.vector_reader(0, crate::wire::U24_LIMIT - 1)?;
        while !list_reader.is_empty() {
            let data = list_reader.varlen_vector(1, crate::wire::U24_LIMIT - 1)?;
            // Certificate entry extensions use the same Certificate-message
            // extension table as EncryptedExtensions; no negotiation-critical
            // extensions appear here in this crate's scope, so an empty or
            // unknown body is parsed opaquely.
            let extensions =
                parse_extension_list(&mut list_reader, HandshakeMessageKind::Certificate)?;
            certificate_list.push(CertificateEntry { data, extensions });
        }

        Ok(Self {
            certificate_request_context,
            certificate_list,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        serialize_varlen_vector(0, crate::wire::U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.certificate_request_context)
        });
        serialize_varlen_vector(0, crate::wire::U24_LIMIT - 1, out, |out| {
            for entry in &self.certificate_list {
                serialize_varlen_vector(1, crate::wire::U24_LIMIT - 1, out, |out| {
                    out.extend_from_slice(&entry.data)
                });
                serialize_extension_list(&entry.extensions, out);
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct CertificateVerify {
    pub algorithm: SignatureScheme,
    pub signature: Bytes,
}

impl CertificateVerify {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let algorithm = SignatureScheme::parse(reader)?;
        let signature = reader.varlen_vector(0, crate::wire::U16_LIMIT)?;
        Ok(Self {
            algorithm,
            signature,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.algorithm.serialize(out);
        serialize_varlen_vector(0, crate::wire::U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.signature)
        });
    }
}

#[derive(Debug, Clone)]
pub struct Finished {
    pub verify_data: Bytes,
}

impl Finished {
    fn parse(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            verify_data: Bytes::copy_from_slice(reader.take(reader.remaining())?),
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.verify_data);
    }
}

#[derive(Debug, Clone)]
pub struct NewSessionTicket {
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
    pub ticket_nonce: Bytes,
    pub ticket: Bytes,
    pub extensions: Vec<Extension>,
}

impl NewSessionTicket {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let ticket_lifetime = reader.u32()?;
        let ticket_age_add = reader.u32()?;
        let ticket_nonce = reader.varlen_vector(0, crate::wire::U8_LIMIT)?;
        let ticket = reader.varlen_vector(1, crate::wire::U16_LIMIT)?;
        let extensions = parse_extension_list(reader, HandshakeMessageKind::EncryptedExtensions)?;
        Ok(Self {
            ticket_lifetime,
            ticket_age_add,
            ticket_nonce,
            ticket,
            extensions,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ticket_lifetime.to_be_bytes());
        out.extend_from_slice(&self.ticket_age_add.to_be_bytes());
        serialize_varlen_vector(0, crate::wire::U8_LIMIT, out, |out| {
            out.extend_from_slice(&self.ticket_nonce)
        });
        serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.ticket)
        });
        serialize_extension_list(&self.extensions, out);
    }
}

tls_enum_u8!(KeyUpdateRequest => {
    update_not_requested(0),
    update_requested(1),
});

#[derive(Debug, Clone)]
pub struct KeyUpdate {
    pub request_update: KeyUpdateRequest,
}

impl KeyUpdate {
    fn parse(reader: &mut Reader) -> Result<Self> {
        Ok(Self {
            request_update: KeyUpdateRequest::parse(reader)?,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.request_update.serialize(out);
    }
}

#[derive(Debug, Clone)]
pub enum Handshake {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    NewSessionTicket(NewSessionTicket),
    EndOfEarlyData,
    EncryptedExtensions(EncryptedExtensions),
    Certificate(Certificate),
    CertificateRequest(CertificateRequest),
    CertificateVerify(CertificateVerify),
    Finished(Finished),
    KeyUpdate(KeyUpdate),
}

impl Handshake {
    pub fn typ(&self) -> HandshakeType {
        match self {
            Handshake::ClientHello(_) => HandshakeType::client_hello,
            Handshake::ServerHello(_) => HandshakeType::server_hello,
            Handshake::NewSessionTicket(_) => HandshakeType::new_session_ticket,
            Handshake::EndOfEarlyData => HandshakeType::end_of_early_data,
            Handshake::EncryptedExtensions(_) => HandshakeType::encrypted_extensions,
            Handshake::Certificate(_) => HandshakeType::certificate,
            Handshake::CertificateRequest(_) => HandshakeType::certificate_request,
            Handshake::CertificateVerify(_) => HandshakeType::certificate_verify,
            Handshake::Finished(_) => HandshakeType::finished,
            Handshake::KeyUpdate(_) => HandshakeType::key_update,
        }
    }

    /// Serializes the `{type, uint24 length, body}` framing and appends the
    /// result to `out`; callers append the returned bytes to the transcript
    /// themselves (§4.1 invariant 1) so the anchor offsets stay accurate.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.typ().serialize(out);
        serialize_varlen_vector(0, crate::wire::U24_LIMIT - 1, out, |out| match self {
            Handshake::ClientHello(m) => m.serialize(out),
            Handshake::ServerHello(m) => m.serialize(out),
            Handshake::NewSessionTicket(m) => m.serialize(out),
            Handshake::EndOfEarlyData => {}
            Handshake::EncryptedExtensions(m) => m.serialize(out),
            Handshake::Certificate(m) => m.serialize(out),
            Handshake::CertificateRequest(m) => m.serialize(out),
            Handshake::CertificateVerify(m) => m.serialize(out),
            Handshake::Finished(m) => m.serialize(out),
            Handshake::KeyUpdate(m) => m.serialize(out),
        });
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let typ = HandshakeType::parse(&mut reader)?;
        let mut body = reader.vector_reader(0, crate::wire::U24_LIMIT - 1)?;

        Ok(match typ {
            HandshakeType::client_hello => Handshake::ClientHello(ClientHello::parse(&mut body)?),
            HandshakeType::server_hello => Handshake::ServerHello(ServerHello::parse(&mut body)?),
            HandshakeType::new_session_ticket => {
                Handshake::NewSessionTicket(NewSessionTicket::parse(&mut body)?)
            }
            HandshakeType::end_of_early_data => Handshake::EndOfEarlyData,
            HandshakeType::encrypted_extensions => {
                Handshake::EncryptedExtensions(EncryptedExtensions::parse(&mut body)?)
            }
            HandshakeType::certificate => Handshake::Certificate(Certificate::parse(&mut body)?),
            HandshakeType::certificate_verify => {
                Handshake::CertificateVerify(CertificateVerify::parse(&mut body)?)
            }
            HandshakeType::finished => Handshake::Finished(Finished::parse(&mut body)?),
            HandshakeType::key_update => Handshake::KeyUpdate(KeyUpdate::parse(&mut body)?),
            HandshakeType::certificate_request => {
                Handshake::CertificateRequest(CertificateRequest::parse(&mut body)?)
            }
            other => {
                return Err(illegal_parameter(format!(
                    "Unsupported handshake message type {:?}",
                    other
                )))
            }
        })
    }
}
