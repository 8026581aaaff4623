use bytemuck::{Pod, Zeroable};

macro_rules! be_int {
    ($name:ident, $int:ty, $len:literal) => {
        /// Big-endian integer with byte alignment, usable inside `Pod` on-disk records.
        #[repr(transparent)]
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn new(value: $int) -> Self {
                Self(value.to_be_bytes())
            }

            pub const fn get(self) -> $int {
                <$int>::from_be_bytes(self.0)
            }
        }

        impl From<$int> for $name {
            fn from(value: $int) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for $int {
            fn from(value: $name) -> Self {
                value.get()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.get(), f)
            }
        }

        impl std::fmt::UpperHex for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::UpperHex::fmt(&self.get(), f)
            }
        }
    };
}

be_int!(BeU16, u16, 2);
be_int!(BeU32, u32, 4);
be_int!(BeU64, u64, 8);
