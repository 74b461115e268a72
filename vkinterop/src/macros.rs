macro_rules! vulkan_bitflags {
    {
        $(#[doc = $ty_doc:literal])*
        $ty:ident
        $( impl { $($impls:item)* } )?
        = $ty_ffi:ident($repr:ty);

        $(
            $(#[doc = $flag_doc:literal])*
            $flag_name:ident = $flag_name_ffi:ident,
        )+
    } => {
        $(#[doc = $ty_doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $ty($repr);

        impl $ty {
            $(
                $(#[doc = $flag_doc])*
                pub const $flag_name: Self = Self(ash::vk::$ty_ffi::$flag_name_ffi.as_raw());
            )*

            #[doc = concat!("Returns a `", stringify!($ty), "` with none of the flags set.")]
            #[inline]
            pub const fn empty() -> Self {
                Self(0)
            }

            #[doc = concat!("Returns a `", stringify!($ty), "` with all of the flags set.")]
            #[inline]
            pub const fn all() -> Self {
                Self(Self::all_raw())
            }

            const fn all_raw() -> $repr {
                0
                $(
                    | ash::vk::$ty_ffi::$flag_name_ffi.as_raw()
                )*
            }

            /// Returns the number of flags set in `self`.
            #[inline]
            pub const fn count(self) -> u32 {
                self.0.count_ones()
            }

            /// Returns whether no flags are set in `self`.
            #[inline]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Returns whether any flags are set in both `self` and `other`.
            #[inline]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Returns whether all flags in `other` are set in `self`.
            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns the union of `self` and `other`.
            #[inline]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Returns the intersection of `self` and `other`.
            #[inline]
            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            /// Returns `self` without the flags set in `other`.
            #[inline]
            pub const fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            $( $($impls)* )?
        }

        impl Default for $ty {
            #[inline]
            fn default() -> Self {
                Self::empty()
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                let mut written = false;

                $(
                    if self.intersects(Self::$flag_name) {
                        if written {
                            write!(f, " | ")?;
                        }

                        write!(f, stringify!($flag_name))?;
                        written = true;
                    }
                )*

                if !written {
                    write!(f, "empty()")?;
                }

                Ok(())
            }
        }

        impl From<$ty> for ash::vk::$ty_ffi {
            #[inline]
            fn from(val: $ty) -> Self {
                ash::vk::$ty_ffi::from_raw(val.0)
            }
        }

        impl From<ash::vk::$ty_ffi> for $ty {
            #[inline]
            fn from(val: ash::vk::$ty_ffi) -> Self {
                Self(val.as_raw() & Self::all_raw())
            }
        }

        impl std::ops::BitAnd for $ty {
            type Output = Self;

            #[inline]
            fn bitand(self, rhs: Self) -> Self {
                self.intersection(rhs)
            }
        }

        impl std::ops::BitOr for $ty {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $ty {
            #[inline]
            fn bitor_assign(&mut self, rhs: Self) {
                *self = self.union(rhs);
            }
        }

        impl std::ops::Sub for $ty {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                self.difference(rhs)
            }
        }
    };
}

macro_rules! vulkan_enum {
    {
        $(#[doc = $ty_doc:literal])*
        $ty:ident
        $( impl { $($impls:item)* } )?
        = $ty_ffi:ident($repr:ty);

        $(
            $(#[doc = $flag_doc:literal])*
            $flag_name:ident = $flag_name_ffi:ident,
        )+
    } => {
        $(#[doc = $ty_doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        #[repr($repr)]
        pub enum $ty {
            $(
                $(#[doc = $flag_doc])*
                $flag_name = ash::vk::$ty_ffi::$flag_name_ffi.as_raw(),
            )+
        }

        impl $ty {
            /// Every value of this type, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$flag_name),+];

            $(
                $($impls)*
            )?
        }

        impl From<$ty> for ash::vk::$ty_ffi {
            #[inline]
            fn from(val: $ty) -> Self {
                ash::vk::$ty_ffi::from_raw(val as $repr)
            }
        }

        impl TryFrom<ash::vk::$ty_ffi> for $ty {
            type Error = ();

            #[inline]
            fn try_from(val: ash::vk::$ty_ffi) -> Result<Self, Self::Error> {
                Ok(match val {
                    $(
                        ash::vk::$ty_ffi::$flag_name_ffi => Self::$flag_name,
                    )+
                    _ => return Err(()),
                })
            }
        }
    };
}

/// Declares a set of external handle type flags together with the enum of the single bits.
macro_rules! vulkan_bitflags_enum {
    {
        $(#[doc = $ty_bitflags_doc:literal])*
        $ty_bitflags:ident,

        $(#[doc = $ty_enum_doc:literal])*
        $ty_enum:ident
        $( impl { $($impls_enum:item)* } )?
        ,

        = $ty_ffi:ident($repr:ty);

        $(
            $(#[doc = $flag_doc:literal])*
            $flag_name_bitflags:ident, $flag_name_enum:ident = $flag_name_ffi:ident,
        )+
    } => {
        crate::macros::vulkan_bitflags! {
            $(#[doc = $ty_bitflags_doc])*
            $ty_bitflags
            impl {
                /// Returns whether `self` contains the flag corresponding to `val`.
                #[inline]
                pub fn contains_enum(self, val: $ty_enum) -> bool {
                    self.intersects(val.into())
                }
            }
            = $ty_ffi($repr);

            $(
                $(#[doc = $flag_doc])*
                $flag_name_bitflags = $flag_name_ffi,
            )+
        }

        crate::macros::vulkan_enum! {
            $(#[doc = $ty_enum_doc])*
            $ty_enum
            $( impl { $($impls_enum)* } )?
            = $ty_ffi($repr);

            $(
                $(#[doc = $flag_doc])*
                $flag_name_enum = $flag_name_ffi,
            )+
        }

        impl From<$ty_enum> for $ty_bitflags {
            #[inline]
            fn from(val: $ty_enum) -> Self {
                Self(val as $repr)
            }
        }

        impl FromIterator<$ty_enum> for $ty_bitflags {
            #[inline]
            fn from_iter<T>(iter: T) -> Self where T: IntoIterator<Item = $ty_enum> {
                iter.into_iter().map(Self::from).fold(Self::empty(), |r, i| r.union(i))
            }
        }

        impl $ty_bitflags {
            /// Iterates over the single handle types set in `self`.
            pub fn iter(self) -> impl Iterator<Item = $ty_enum> {
                $ty_enum::ALL
                    .iter()
                    .copied()
                    .filter(move |&val| self.contains_enum(val))
            }
        }
    };
}

macro_rules! impl_id_counter {
    ($type:ident) => {
        impl $type {
            fn next_id() -> std::num::NonZero<u64> {
                use std::{
                    num::NonZero,
                    sync::atomic::{AtomicU64, Ordering},
                };

                static COUNTER: AtomicU64 = AtomicU64::new(1);

                NonZero::<u64>::new(COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
                    eprintln!("an ID counter has overflown ...somehow");
                    std::process::abort();
                })
            }

            #[allow(dead_code)]
            pub(crate) fn id(&self) -> std::num::NonZero<u64> {
                self.id
            }
        }

        impl PartialEq for $type {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $type {}

        impl std::hash::Hash for $type {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }
    };
}

pub(crate) use impl_id_counter;
pub(crate) use vulkan_bitflags;
pub(crate) use vulkan_bitflags_enum;
pub(crate) use vulkan_enum;
