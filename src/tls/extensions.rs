//! The TLS 1.3 extension framework (C3): the TLV codec plus the typed
//! bodies needed to drive a full handshake — including `key_share` (C4) and
//! `pre_shared_key` (C5), which get their own negotiation-logic modules.

use bytes::Bytes;

use crate::error::{illegal_parameter, Result};
use crate::wire::{serialize_varlen_vector, Reader};

tls_enum_u16!(NamedGroup => {
    secp256r1(23),
    secp384r1(24),
    secp521r1(25),
    x25519(29),
    x448(30),
    ffdhe2048(256),
    ffdhe3072(257),
    ffdhe4096(258),
    ffdhe6144(259),
    ffdhe8192(260),
});

tls_enum_u16!(SignatureScheme => {
    rsa_pkcs1_sha1(0x0201),
    ecdsa_sha1(0x0203),
    rsa_pkcs1_sha256(0x0401),
    rsa_pkcs1_sha384(0x0501),
    rsa_pkcs1_sha512(0x0601),
    ecdsa_secp256r1_sha256(0x0403),
    ecdsa_secp384r1_sha384(0x0503),
    ecdsa_secp521r1_sha512(0x0603),
    rsa_pss_rsae_sha256(0x0804),
    rsa_pss_rsae_sha384(0x0805),
    rsa_pss_rsae_sha512(0x0806),
    ed25519(0x0807),
    ed448(0x0808),
    rsa_pss_pss_sha256(0x0809),
    rsa_pss_pss_sha384(0x080a),
    rsa_pss_pss_sha512(0x080b),
});

tls_enum_u16!(ExtensionType => {
    server_name(0),
    supported_groups(10),
    signature_algorithms(13),
    alpn(16),
    signature_algorithms_cert(50),
    key_share(51),
    pre_shared_key(41),
    early_data(42),
    supported_versions(43),
    cookie(44),
    psk_key_exchange_modes(45),
    certificate_authorities(47),
});

/// Which handshake message an extension may legally appear in (RFC 8446
/// §4.2). Used by `HandshakeMessageKind` to reject misplaced extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessageKind {
    ClientHello,
    ServerHello,
    HelloRetryRequest,
    EncryptedExtensions,
    CertificateRequest,
    Certificate,
}

impl ExtensionType {
    pub fn allowed_in(&self, msg: HandshakeMessageKind) -> bool {
        use HandshakeMessageKind::*;
        match self {
            ExtensionType::server_name => matches!(msg, ClientHello | EncryptedExtensions),
            ExtensionType::supported_groups => matches!(msg, ClientHello | EncryptedExtensions),
            ExtensionType::signature_algorithms => matches!(msg, ClientHello | CertificateRequest),
            ExtensionType::signature_algorithms_cert => {
                matches!(msg, ClientHello | CertificateRequest)
            }
            ExtensionType::alpn => matches!(msg, ClientHello | EncryptedExtensions),
            ExtensionType::key_share => {
                matches!(msg, ClientHello | ServerHello | HelloRetryRequest)
            }
            ExtensionType::pre_shared_key => matches!(msg, ClientHello | ServerHello),
            ExtensionType::early_data => matches!(msg, ClientHello | EncryptedExtensions),
            ExtensionType::supported_versions => {
                matches!(msg, ClientHello | ServerHello | HelloRetryRequest)
            }
            ExtensionType::cookie => matches!(msg, ClientHello | HelloRetryRequest),
            ExtensionType::psk_key_exchange_modes => matches!(msg, ClientHello),
            ExtensionType::certificate_authorities => {
                matches!(msg, ClientHello | CertificateRequest)
            }
            ExtensionType::unknown(_) => true,
        }
    }

    /// `supported_versions` is the sole "must understand" extension this
    /// crate cares about: a ClientHello/ServerHello lacking it is not TLS
    /// 1.3 and the state machine must not silently proceed.
    pub fn must_understand(&self) -> bool {
        matches!(self, ExtensionType::supported_versions)
    }
}

#[derive(Debug, Clone)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Bytes,
}

impl KeyShareEntry {
    fn parse(reader: &mut Reader) -> Result<Self> {
        let group = NamedGroup::parse(reader)?;
        let key_exchange = reader.varlen_vector(1, crate::wire::U16_LIMIT)?;
        Ok(Self {
            group,
            key_exchange,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.group.serialize(out);
        serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
            out.extend_from_slice(&self.key_exchange)
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyShareClientHello {
    pub client_shares: Vec<KeyShareEntry>,
}

#[derive(Debug, Clone)]
pub struct KeyShareHelloRetryRequest {
    pub selected_group: NamedGroup,
}

#[derive(Debug, Clone)]
pub struct KeyShareServerHello {
    pub server_share: KeyShareEntry,
}

#[derive(Debug, Clone)]
pub struct PskIdentity {
    pub identity: Bytes,
    pub obfuscated_ticket_age: u32,
}

#[derive(Debug, Clone, Default)]
pub struct OfferedPsks {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub enum PreSharedKey {
    ClientHello(OfferedPsks),
    ServerHello { selected_identity: u16 },
}

tls_enum_u8!(PskKeyExchangeMode => {
    psk_ke(0),
    psk_dhe_ke(1),
});

#[derive(Debug, Clone, Default)]
pub struct PskKeyExchangeModes {
    pub modes: Vec<PskKeyExchangeMode>,
}

#[derive(Debug, Clone, Default)]
pub struct EarlyDataIndication;

#[derive(Debug, Clone)]
pub enum ServerName {
    HostName(Bytes),
}

#[derive(Debug, Clone, Default)]
pub struct ServerNameList {
    pub names: Vec<ServerName>,
}

#[derive(Debug, Clone, Default)]
pub struct NamedGroupList {
    pub groups: Vec<NamedGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct SignatureSchemeList {
    pub schemes: Vec<SignatureScheme>,
}

/// Version 0x0304 = TLS 1.3.
pub const TLS_1_3_VERSION: u16 = 0x0304;

#[derive(Debug, Clone, Default)]
pub struct SupportedVersionsClientHello {
    pub versions: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct SupportedVersionsServerHello {
    pub selected_version: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolNameList {
    pub names: Vec<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct CertificateAuthorities {
    /// DER-encoded `Name` values; X.501 parsing is out of scope.
    pub authorities: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub enum Extension {
    ServerName(Option<ServerNameList>),
    SupportedGroups(NamedGroupList),
    SignatureAlgorithms(SignatureSchemeList),
    SignatureAlgorithmsCert(SignatureSchemeList),
    ALPN(ProtocolNameList),
    KeyShareClientHello(KeyShareClientHello),
    KeyShareHelloRetryRequest(KeyShareHelloRetryRequest),
    KeyShareServerHello(KeyShareServerHello),
    PreSharedKey(PreSharedKey),
    PskKeyExchangeModes(PskKeyExchangeModes),
    EarlyData(EarlyDataIndication),
    SupportedVersionsClientHello(SupportedVersionsClientHello),
    SupportedVersionsServerHello(SupportedVersionsServerHello),
    Cookie(Bytes),
    CertificateAuthorities(CertificateAuthorities),
    Unknown { typ: ExtensionType, data: Bytes },
}

impl Extension {
    pub fn typ(&self) -> ExtensionType {
        match self {
            Extension::ServerName(_) => ExtensionType::server_name,
            Extension::SupportedGroups(_) => ExtensionType::supported_groups,
            Extension::SignatureAlgorithms(_) => ExtensionType::signature_algorithms,
            Extension::SignatureAlgorithmsCert(_) => ExtensionType::signature_algorithms_cert,
            Extension::ALPN(_) => ExtensionType::alpn,
            Extension::KeyShareClientHello(_)
            | Extension::KeyShareHelloRetryRequest(_)
            | Extension::KeyShareServerHello(_) => ExtensionType::key_share,
            Extension::PreSharedKey(_) => ExtensionType::pre_shared_key,
            Extension::PskKeyExchangeModes(_) => ExtensionType::psk_key_exchange_modes,
            Extension::EarlyData(_) => ExtensionType::early_data,
            Extension::SupportedVersionsClientHello(_)
            | Extension::SupportedVersionsServerHello(_) => ExtensionType::supported_versions,
            Extension::Cookie(_) => ExtensionType::cookie,
            Extension::CertificateAuthorities(_) => ExtensionType::certificate_authorities,
            Extension::Unknown { typ, .. } => *typ,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.typ().serialize(out);
        serialize_varlen_vector(0, crate::wire::U16_LIMIT, out, |out| match self {
            Extension::ServerName(list) => {
                if let Some(list) = list {
                    serialize_varlen_vector(0, crate::wire::U16_LIMIT, out, |out| {
                        for name in &list.names {
                            match name {
                                ServerName::HostName(host) => {
                                    out.push(0);
                                    serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
                                        out.extend_from_slice(host)
                                    });
                                }
                            }
                        }
                    });
                }
            }
            Extension::SupportedGroups(list) => {
                serialize_varlen_vector(2, crate::wire::U16_LIMIT, out, |out| {
                    for g in &list.groups {
                        g.serialize(out);
                    }
                });
            }
            Extension::SignatureAlgorithms(list) | Extension::SignatureAlgorithmsCert(list) => {
                serialize_varlen_vector(2, crate::wire::U16_LIMIT, out, |out| {
                    for s in &list.schemes {
                        s.serialize(out);
                    }
                });
            }
            Extension::ALPN(list) => {
                serialize_varlen_vector(2, crate::wire::U16_LIMIT, out, |out| {
                    for name in &list.names {
                        serialize_varlen_vector(1, crate::wire::U8_LIMIT, out, |out| {
                            out.extend_from_slice(name)
                        });
                    }
                });
            }
            Extension::KeyShareClientHello(ks) => {
                serialize_varlen_vector(0, crate::wire::U16_LIMIT, out, |out| {
                    for entry in &ks.client_shares {
                        entry.serialize(out);
                    }
                });
            }
            Extension::KeyShareHelloRetryRequest(ks) => {
                ks.selected_group.serialize(out);
            }
            Extension::KeyShareServerHello(ks) => {
                ks.server_share.serialize(out);
            }
            Extension::PreSharedKey(psk) => match psk {
                PreSharedKey::ClientHello(offered) => {
                    serialize_varlen_vector(7, crate::wire::U16_LIMIT, out, |out| {
                        for id in &offered.identities {
                            serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
                                out.extend_from_slice(&id.identity)
                            });
                            out.extend_from_slice(&id.obfuscated_ticket_age.to_be_bytes());
                        }
                    });
                    serialize_varlen_vector(33, crate::wire::U16_LIMIT, out, |out| {
                        for binder in &offered.binders {
                            serialize_varlen_vector(32, crate::wire::U8_LIMIT, out, |out| {
                                out.extend_from_slice(binder)
                            });
                        }
                    });
                }
                PreSharedKey::ServerHello { selected_identity } => {
                    out.extend_from_slice(&selected_identity.to_be_bytes());
                }
            },
            Extension::PskKeyExchangeModes(modes) => {
                serialize_varlen_vector(1, crate::wire::U8_LIMIT, out, |out| {
                    for m in &modes.modes {
                        m.serialize(out);
                    }
                });
            }
            Extension::EarlyData(_) => {}
            Extension::SupportedVersionsClientHello(v) => {
                serialize_varlen_vector(2, crate::wire::U8_LIMIT, out, |out| {
                    for version in &v.versions {
                        out.extend_from_slice(&version.to_be_bytes());
                    }
                });
            }
            Extension::SupportedVersionsServerHello(v) => {
                out.extend_from_slice(&v.selected_version.to_be_bytes());
            }
            Extension::Cookie(data) => {
                serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
                    out.extend_from_slice(data)
                });
            }
            Extension::CertificateAuthorities(ca) => {
                serialize_varlen_vector(3, crate::wire::U16_LIMIT, out, |out| {
                    for name in &ca.authorities {
                        serialize_varlen_vector(1, crate::wire::U16_LIMIT, out, |out| {
                            out.extend_from_slice(name)
                        });
                    }
                });
            }
            Extension::Unknown { data, .. } => {
                out.extend_from_slice(data);
            }
        });
    }

    /// Parses one `{type, length, data}` entry. `msg` disambiguates
    /// `key_share`/`pre_shared_key`/`supported_versions` bodies, whose shape
    /// differs between ClientHello/ServerHello/HRR.
    pub fn parse(reader: &mut Reader, msg: HandshakeMessageKind) -> Result<Self> {
        let typ = ExtensionType::parse(reader)?;
        if !typ.allowed_in(msg) {
            return Err(illegal_parameter(format!(
                "Extension {:?} not allowed in {:?}",
                typ, msg
            )));
        }

        let mut body = reader.vector_reader(0, crate::wire::U16_LIMIT)?;

        Ok(match typ {
            ExtensionType::server_name => {
                if body.is_empty() {
                    Extension::ServerName(None)
                } else {
                    let mut list_reader = body.vector_reader(0, crate::wire::U16_LIMIT)?;
                    let mut names = vec![];
                    while !list_reader.is_empty() {
                        let name_type = list_reader.u8()?;
                        if name_type != 0 {
                            return Err(illegal_parameter("Unsupported server_name type"));
                        }
                        let host = list_reader.varlen_vector(1, crate::wire::U16_LIMIT)?;
                        names.push(ServerName::HostName(host));
                    }
                    Extension::ServerName(Some(ServerNameList { names }))
                }
            }
            ExtensionType::supported_groups => {
                let mut list_reader = body.vector_reader(2, crate::wire::U16_LIMIT)?;
                let mut groups = vec![];
                while !list_reader.is_empty() {
                    groups.push(NamedGroup::parse(&mut list_reader)?);
                }
                Extension::SupportedGroups(NamedGroupList { groups })
            }
            ExtensionType::signature_algorithms | ExtensionType::signature_algorithms_cert => {
                let mut list_reader = body.vector_reader(2, crate::wire::U16_LIMIT)?;
                let mut schemes = vec![];
                while !list_reader.is_empty() {
                    schemes.push(SignatureScheme::parse(&mut list_reader)?);
                }
                let list = SignatureSchemeList { schemes };
                if typ == ExtensionType::signature_algorithms {
                    Extension::SignatureAlgorithms(list)
                } else {
                    Extension::SignatureAlgorithmsCert(list)
                }
            }
            ExtensionType::alpn => {
                let mut list_reader = body.vector_reader(2, crate::wire::U16_LIMIT)?;
                let mut names = vec![];
                while !list_reader.is_empty() {
                    names.push(list_reader.varlen_vector(1, crate::wire::U8_LIMIT)?);
                }
                Extension::ALPN(ProtocolNameList { names })
            }
            ExtensionType::key_share => match msg {
                HandshakeMessageKind::ClientHello => {
                    let mut list_reader = body.vector_reader(0, crate::wire::U16_LIMIT)?;
                    let mut client_shares = vec![];
                    while !list_reader.is_empty() {
                        client_shares.push(KeyShareEntry::parse(&mut list_reader)?);
                    }
                    Extension::KeyShareClientHello(KeyShareClientHello { client_shares })
                }
                HandshakeMessageKind::HelloRetryRequest => {
                    Extension::KeyShareHelloRetryRequest(KeyShareHelloRetryRequest {
                        selected_group: NamedGroup::parse(&mut body)?,
                    })
                }
                HandshakeMessageKind::ServerHello => {
                    Extension::KeyShareServerHello(KeyShareServerHello {
                        server_share: KeyShareEntry::parse(&mut body)?,
                    })
                }
                _ => return Err(illegal_parameter("key_share not allowed here")),
            },
            ExtensionType::pre_shared_key => match msg {
                HandshakeMessageKind::ClientHello => {
                    let mut id_reader = body.vector_reader(7, crate::wire::U16_LIMIT)?;
                    let mut identities = vec![];
                    while !id_reader.is_empty() {
                        let identity = id_reader.varlen_vector(1, crate::wire::U16_LIMIT)?;
                        let obfuscated_ticket_age = id_reader.u32()?;
                        identities.push(PskIdentity {
                            identity,
                            obfuscated_ticket_age,
                        });
                    }
                    let mut binder_reader = body.vector_reader(33, crate::wire::U16_LIMIT)?;
                    let mut binders = vec![];
                    while !binder_reader.is_empty() {
                        binders.push(binder_reader.varlen_vector(32, crate::wire::U8_LIMIT)?);
                    }
                    Extension::PreSharedKey(PreSharedKey::ClientHello(OfferedPsks {
                        identities,
                        binders,
                    }))
                }
                HandshakeMessageKind::ServerHello => Extension::PreSharedKey(
                    PreSharedKey::ServerHello {
                        selected_identity: body.u16()?,
                    },
                ),
                _ => return Err(illegal_parameter("pre_shared_key not allowed here")),
            },
            ExtensionType::psk_key_exchange_modes => {
                let mut list_reader = body.vector_reader(1, crate::wire::U8_LIMIT)?;
                let mut modes = vec![];
                while !list_reader.is_empty() {
                    modes.push(PskKeyExchangeMode::parse(&mut list_reader)?);
                }
                Extension::PskKeyExchangeModes(PskKeyExchangeModes { modes })
            }
            ExtensionType::early_data => Extension::EarlyData(EarlyDataIndication),
            ExtensionType::supported_versions => match msg {
                HandshakeMessageKind::ClientHello => {
                    let mut list_reader = body.vector_reader(2, crate::wire::U8_LIMIT)?;
                    let mut versions = vec![];
                    while !list_reader.is_empty() {
                        versions.push(list_reader.u16()?);
                    }
                    Extension::SupportedVersionsClientHello(SupportedVersionsClientHello {
                        versions,
                    })
                }
                HandshakeMessageKind::ServerHello | HandshakeMessageKind::HelloRetryRequest => {
                    Extension::SupportedVersionsServerHello(SupportedVersionsServerHello {
                        selected_version: body.u16()?,
                    })
                }
                _ => return Err(illegal_parameter("supported_versions not allowed here")),
            },
            ExtensionType::cookie => {
                Extension::Cookie(body.varlen_vector(1, crate::wire::U16_LIMIT)?)
            }
            ExtensionType::certificate_authorities => {
                let mut list_reader = body.vector_reader(3, crate::wire::U16_LIMIT)?;
                let mut authorities = vec![];
                while !list_reader.is_empty() {
                    authorities.push(list_reader.varlen_vector(1, crate::wire::U16_LIMIT)?);
                }
                Extension::CertificateAuthorities(CertificateAuthorities { authorities })
            }
            ExtensionType::unknown(_) => Extension::Unknown {
                typ,
                data: Bytes::copy_from_slice(body.take(body.remaining())?),
            },
        })
    }
}

/// Parses a `uint16`-length-prefixed extension list.
pub fn parse_extension_list(
    reader: &mut Reader,
    msg: HandshakeMessageKind,
) -> Result<Vec<Extension>> {
    let mut list_reader = reader.vector_reader(0, crate::wire::U16_LIMIT)?;
    let mut extensions = vec![];
    while !list_reader.is_empty() {
        extensions.push(Extension::parse(&mut list_reader, msg)?);
    }
    Ok(extensions)
}

/// Serializes an extension list using the deferred-length back-patch
/// pattern described in §4.3.
pub fn serialize_extension_list(extensions: &[Extension], out: &mut Vec<u8>) {
    serialize_varlen_vector(0, crate::wire::U16_LIMIT, out, |out| {
        for ext in extensions {
            ext.serialize(out);
        }
    });
}

pub fn find<'a, F, T>(extensions: &'a [Extension], f: F) -> Option<T>
where
    F: Fn(&'a Extension) -> Option<T>,
{
    extensions.iter().find_map(f)
}
