//! Declarative macros for generating TLS wire enums, adapted from the
//! combinator-parser style to hand-written `Reader`/`Vec<u8>` codecs.

/// Defines a C-like enum backed by a `u8` wire value, with an `unknown(u8)`
/// catch-all variant for values outside the known set (used for things like
/// `AlertDescription` where unrecognised values must still round-trip).
#[macro_export]
macro_rules! tls_enum_u8 {
    ($(#[$meta:meta])* $name:ident => { $($variant:ident($val:expr)),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        pub enum $name {
            $($variant),*,
            unknown(u8),
        }

        impl $name {
            pub fn to_u8(&self) -> u8 {
                match self {
                    $($name::$variant => $val),*,
                    $name::unknown(v) => *v,
                }
            }

            pub fn from_u8(v: u8) -> Self {
                match v {
                    $($val => $name::$variant),*,
                    _ => $name::unknown(v),
                }
            }

            pub fn parse(reader: &mut $crate::wire::Reader) -> $crate::error::Result<Self> {
                Ok(Self::from_u8(reader.u8()?))
            }

            pub fn serialize(&self, out: &mut Vec<u8>) {
                out.push(self.to_u8());
            }
        }
    };
}

/// Defines a C-like enum backed by a `u16` wire value, with an `unknown(u16)`
/// catch-all (used for `NamedGroup`, `SignatureScheme`, `ExtensionType`,
/// `CipherSuite`).
#[macro_export]
macro_rules! tls_enum_u16 {
    ($(#[$meta:meta])* $name:ident => { $($variant:ident($val:expr)),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        pub enum $name {
            $($variant),*,
            unknown(u16),
        }

        impl $name {
            pub fn to_u16(&self) -> u16 {
                match self {
                    $($name::$variant => $val),*,
                    $name::unknown(v) => *v,
                }
            }

            pub fn from_u16(v: u16) -> Self {
                match v {
                    $($val => $name::$variant),*,
                    _ => $name::unknown(v),
                }
            }

            pub fn parse(reader: &mut $crate::wire::Reader) -> $crate::error::Result<Self> {
                Ok(Self::from_u16(reader.u16()?))
            }

            pub fn serialize(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_u16().to_be_bytes());
            }
        }
    };
}
