//! `key_share` negotiation (C4): client share generation, server selection
//! (including triggering a HelloRetryRequest on group mismatch), and the
//! client-side re-generation that follows an HRR.

use bytes::Bytes;

use crate::error::{illegal_parameter, Error, Result};
use crate::primitives::CryptoProvider;
use crate::tls::alert::AlertDescription;
use crate::tls::extensions::{KeyShareClientHello, KeyShareEntry, NamedGroup};

/// The client's live `(group, private_key)` pairs for the shares it has
/// most recently offered. Replaced wholesale on an HRR (invariant: a client
/// never reuses a private key across a retry).
pub struct ClientKeyShares {
    entries: Vec<(NamedGroup, Vec<u8>)>,
}

impl ClientKeyShares {
    /// Generates one share per group in `groups`, in order. RFC 8446 §9.1
    /// recommends offering a single share (the most preferred group) to
    /// avoid wasted key generation; callers pass a one-element slice for
    /// that default and a longer one to pre-empt an HRR round trip.
    pub fn generate(
        provider: &dyn CryptoProvider,
        groups: &[NamedGroup],
    ) -> Result<(Self, KeyShareClientHello)> {
        let mut entries = vec![];
        let mut client_shares = vec![];

        for group in groups {
            let dh = provider.diffie_hellman(*group)?;
            let (public, private) = dh.generate_keypair()?;
            entries.push((*group, private));
            client_shares.push(KeyShareEntry {
                group: *group,
                key_exchange: Bytes::from(public),
            });
        }

        Ok((Self { entries }, KeyShareClientHello { client_shares }))
    }

    pub fn private_key_for(&self, group: NamedGroup) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, k)| k.as_slice())
    }

    /// Regenerates a single fresh share for `selected_group` after an HRR.
    /// Rejects a group the client already offered in CH1 (the server
    /// should never ask for one of those) and one the client doesn't
    /// actually support.
    pub fn regenerate_after_retry(
        &self,
        provider: &dyn CryptoProvider,
        client_supported_groups: &[NamedGroup],
        selected_group: NamedGroup,
    ) -> Result<(Self, KeyShareEntry)> {
        if self.private_key_for(selected_group).is_some() {
            return Err(illegal_parameter(
                "HelloRetryRequest selected a group already offered in ClientHello1",
            ));
        }
        if !client_supported_groups.contains(&selected_group) {
            return Err(illegal_parameter(
                "HelloRetryRequest selected a group the client does not support",
            ));
        }

        let dh = provider.diffie_hellman(selected_group)?;
        let (public, private) = dh.generate_keypair()?;
        let entry = KeyShareEntry {
            group: selected_group,
            key_exchange: Bytes::from(public),
        };
        Ok((
            Self {
                entries: vec![(selected_group, private)],
            },
            entry,
        ))
    }
}

/// What the server does with an offered `key_share` extension.
pub enum ServerKeyShareDecision {
    Accept {
        server_share: KeyShareEntry,
        shared_secret: Vec<u8>,
    },
    Retry {
        group: NamedGroup,
    },
}

/// Picks the highest-preference group (by `server_supported_groups` order)
/// that the client either offered a share for, or merely advertised
/// support for (triggering a retry). Fails closed if no group is shared at
/// all.
pub fn server_select(
    provider: &dyn CryptoProvider,
    server_supported_groups: &[NamedGroup],
    client_shares: &KeyShareClientHello,
    client_supported_groups: &[NamedGroup],
) -> Result<ServerKeyShareDecision> {
    for group in server_supported_groups {
        if let Some(entry) = client_shares
            .client_shares
            .iter()
            .find(|entry| entry.group == *group)
        {
            let dh = provider.diffie_hellman(*group)?;
            let (public, private) = dh.generate_keypair()?;
            let shared_secret = dh.shared_secret(&entry.key_exchange, &private)?;
            return Ok(ServerKeyShareDecision::Accept {
                server_share: KeyShareEntry {
                    group: *group,
                    key_exchange: Bytes::from(public),
                },
                shared_secret,
            });
        }
    }

    for group in server_supported_groups {
        if client_supported_groups.contains(group) {
            return Ok(ServerKeyShareDecision::Retry { group: *group });
        }
    }

    Err(Error::fatal(
        AlertDescription::handshake_failure,
        "No mutually supported key exchange group",
    ))
}

/// Finalizes the client's side of key exchange once the real ServerHello's
/// `key_share` names the group and public value the server settled on.
pub fn client_compute_shared_secret(
    provider: &dyn CryptoProvider,
    shares: &ClientKeyShares,
    server_share: &KeyShareEntry,
) -> Result<Vec<u8>> {
    let private = shares.private_key_for(server_share.group).ok_or_else(|| {
        illegal_parameter("ServerHello selected a group the client did not offer a share for")
    })?;
    let dh = provider.diffie_hellman(server_share.group)?;
    dh.shared_secret(&server_share.key_exchange, private)
}
