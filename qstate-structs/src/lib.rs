#[macro_export]
macro_rules! serializable_struct_with_getters {
    ( @ $(#[$sattr:meta])* $name:ident { } -> ($($fields:tt)*) ($($getters:tt)*) ) => (
        #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
        $(#[$sattr])*
        pub struct $name {
            $($fields)*
        }
        impl $name {
            $($getters)*
        }
    );
    ( @ $(#[$sattr:meta])* $name:ident { $(#[$attr:meta])* $param:ident : Option<$type:ty>, $($rest:tt)* } -> ($($fields:tt)*) ($($getters:tt)*) ) => (
        $crate::serializable_struct_with_getters!(@ $(#[$sattr])* $name { $($rest)* } -> (
            $($fields)*
            $(#[$attr])*
            #[serde(default)]
            pub $param : Option<$type>,
        ) (
            $($getters)*
            pub fn $param(&self) -> Option<&$type> {
                self.$param.as_ref()
            }
        ));
    );

    ( @ $(#[$sattr:meta])* $name:ident { $(#[$attr:meta])* $param:ident : $type:ty, $($rest:tt)* } -> ($($fields:tt)*) ($($getters:tt)*) ) => (
        $crate::serializable_struct_with_getters!(@ $(#[$sattr])* $name { $($rest)* } -> (
            $($fields)*
            $(#[$attr])*
            pub $param : $type,
        ) (
            $($getters)*
        ));
    );
    ( $(#[$sattr:meta])* $name:ident { $( $rest:tt)* } ) => {
        $crate::serializable_struct_with_getters!(@ $(#[$sattr])* $name { $($rest)* } -> () ());
    };
}

/// Declares a struct whose serde form is a single base64 string holding the
/// gzip compressed bincode encoding of its fields. Floats survive the trip
/// bit-for-bit, which plain json numbers do not guarantee.
macro_rules! impl_base64_serde {
    ($name:ident { $( $(#[$attr:meta])* $field:ident : $ty:ty ),* $(,)? }) => {
        paste::paste! {
            #[derive(Debug, Clone, PartialEq)]
            pub struct $name {
                $( $(#[$attr])* pub $field : $ty ),*
            }

            #[derive(serde::Serialize)]
            struct [<$name DataRef>]<'a> {
                $( $field : &'a $ty ),*
            }

            #[derive(serde::Deserialize)]
            struct [<$name Data>] {
                $( $field : $ty ),*
            }

            impl serde::Serialize for $name {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    use base64::engine::general_purpose::STANDARD as BASE64;
                    use base64::Engine;
                    use flate2::{write::GzEncoder, Compression};
                    use std::io::Write;

                    let helper = [<$name DataRef>] {
                        $( $field: &self.$field ),*
                    };

                    let bincode_data = bincode::serialize(&helper).map_err(|e| {
                        serde::ser::Error::custom(format!("Bincode serialization failed: {}", e))
                    })?;

                    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                    encoder
                        .write_all(&bincode_data)
                        .map_err(|e| serde::ser::Error::custom(format!("Compression failed: {}", e)))?;
                    let compressed_data = encoder.finish().map_err(|e| {
                        serde::ser::Error::custom(format!("Compression finish failed: {}", e))
                    })?;

                    serializer.serialize_str(&BASE64.encode(&compressed_data))
                }
            }

            impl<'de> serde::Deserialize<'de> for $name {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    use base64::engine::general_purpose::STANDARD as BASE64;
                    use base64::Engine;
                    use flate2::read::GzDecoder;
                    use std::fmt;
                    use std::io::Read;

                    struct VisitorImpl;

                    impl<'de> serde::de::Visitor<'de> for VisitorImpl {
                        type Value = $name;

                        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                            write!(
                                f,
                                "a base64 encoded, compressed, bincode serialized {}",
                                stringify!($name)
                            )
                        }

                        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                        where
                            E: serde::de::Error,
                        {
                            let compressed = BASE64
                                .decode(v)
                                .map_err(|e| E::custom(format!("Base64 decode failed: {}", e)))?;

                            let mut decoder = GzDecoder::new(&compressed[..]);
                            let mut decompressed = Vec::new();
                            decoder
                                .read_to_end(&mut decompressed)
                                .map_err(|e| E::custom(format!("Decompression failed: {}", e)))?;

                            let data: [<$name Data>] = bincode::deserialize(&decompressed)
                                .map_err(|e| {
                                    E::custom(format!("Bincode deserialization failed: {}", e))
                                })?;

                            Ok($name {
                                $( $field: data.$field ),*
                            })
                        }
                    }

                    deserializer.deserialize_str(VisitorImpl)
                }
            }
        }
    };
}
pub(crate) use impl_base64_serde;

pub mod config;
pub mod core;
