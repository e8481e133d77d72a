//! Helpers used to define types that are backed by integers (typically `u32`),
//! without compromising safety.
//!
//! # Example
//!
//! ```
//! /// Define an opaque type `IrqNumber` backed by a `u32`.
//! int_like!(IrqNumber, u32);
//!
//! const ZERO: IrqNumber = IrqNumber::new(0);
//! ```

#[macro_export]
macro_rules! int_like {
    ($new_type_name:ident, $backing_type: ident) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
        pub struct $new_type_name($backing_type);

        impl $new_type_name {
            #[allow(dead_code)]
            pub const fn into(self) -> $backing_type {
                self.0
            }

            #[allow(dead_code)]
            pub const fn from(x: $backing_type) -> Self {
                $new_type_name(x)
            }

            #[allow(dead_code)]
            pub const fn new(x: $backing_type) -> Self {
                Self::from(x)
            }

            #[allow(dead_code)]
            pub const fn data(&self) -> $backing_type {
                self.0
            }
        }
    };
}
