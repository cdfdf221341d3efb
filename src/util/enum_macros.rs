/// Generates an enum for a BACnet enumeration whose values are partly
/// standardised and partly open to vendors or local use.
///
/// Named variants map to their listed values. Any other value inside
/// `$custom_range` becomes `Custom`, anything outside it `Reserved`. Values
/// survive a trip through the underlying integer unchanged, which matters for
/// fields such as abort reasons that are relayed between peers.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - Named variants and their values.
/// * `$unit:ident` - The underlying integer type (`u8`, `u16`, `u32`).
/// * `$range:expr` - The range of values open to custom use.
///
/// # Example
///
/// ```rust
/// use bacnet_tsm::generate_custom_enum;
///
/// generate_custom_enum! {
///     RejectReason {
///         Other = 0,
///         BufferOverflow = 1,
///         UnrecognizedService = 9,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(u8::from(RejectReason::UnrecognizedService), 9);
/// assert_eq!(format!("{}", RejectReason::Other), "Other");
/// match RejectReason::from(100u8) {
///     RejectReason::Custom(value) => assert_eq!(value.value(), 100),
///     other => panic!("unexpected {other:?}"),
/// }
/// assert!(matches!(RejectReason::from(20u8), RejectReason::Reserved(_)));
/// ```
///
/// Besides the enum the macro generates a `<Name>Value` newtype for the
/// `Custom`/`Reserved` payloads, `Display`, and `From` conversions in both
/// directions.
#[macro_export]
macro_rules! generate_custom_enum {
    (
        $(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ },
        $unit:ident,
        $custom_range:expr
    ) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                Custom( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                fn new(value: $unit) -> Self {
                    Self { value }
                }

                /// Raw value as carried on the wire
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Custom( value ) => write!(f, "Custom({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Custom( value ) => value.value(),
                        $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => $name::Custom([<$name Value>]::new(v)),
                        v => $name::Reserved([<$name Value>]::new(v)),
                    }
                }
            }
        }
    };
}
