//! Intrusive, non-owning linked lists
//!
//! The link fields live inside the element, so joining a list never
//! allocates. A type becomes listable by embedding a link entry and
//! implementing [`DoublyLinked`] / [`SinglyLinked`], which the
//! [`impl_doubly_linked!`](crate::impl_doubly_linked) and
//! [`impl_singly_linked!`](crate::impl_singly_linked) macros do from a
//! field name.
//!
//! Lists never own their elements. Whoever links an element must keep it
//! alive and in place until it is unlinked again.

pub mod doubly;
pub mod singly;

pub use doubly::{DoublyLinked, DoublyLinkedList, DoublyLinkedListEntry};
pub use singly::{SinglyLinked, SinglyLinkedList, SinglyLinkedListEntry};

/// Make `$ty` usable with [`DoublyLinkedList`] through its `$field` entry
#[macro_export]
macro_rules! impl_doubly_linked {
    ($ty:ty, $field:ident) => {
        unsafe impl $crate::list::DoublyLinked for $ty {
            #[inline]
            fn entry_of(
                this: ::core::ptr::NonNull<Self>,
            ) -> ::core::ptr::NonNull<$crate::list::DoublyLinkedListEntry> {
                // Safety: `this` points to a live `$ty`, field projection stays in bounds
                unsafe {
                    ::core::ptr::NonNull::new_unchecked(::core::ptr::addr_of_mut!(
                        (*this.as_ptr()).$field
                    ))
                }
            }

            #[inline]
            unsafe fn from_entry(
                entry: ::core::ptr::NonNull<$crate::list::DoublyLinkedListEntry>,
            ) -> ::core::ptr::NonNull<Self> {
                let offset = ::core::mem::offset_of!($ty, $field);
                ::core::ptr::NonNull::new_unchecked(
                    entry.as_ptr().cast::<u8>().sub(offset).cast::<Self>(),
                )
            }
        }
    };
}

/// Make `$ty` usable with [`SinglyLinkedList`] through its `$field` entry
#[macro_export]
macro_rules! impl_singly_linked {
    ($ty:ty, $field:ident) => {
        unsafe impl $crate::list::SinglyLinked for $ty {
            #[inline]
            fn entry_of(
                this: ::core::ptr::NonNull<Self>,
            ) -> ::core::ptr::NonNull<$crate::list::SinglyLinkedListEntry> {
                // Safety: `this` points to a live `$ty`, field projection stays in bounds
                unsafe {
                    ::core::ptr::NonNull::new_unchecked(::core::ptr::addr_of_mut!(
                        (*this.as_ptr()).$field
                    ))
                }
            }

            #[inline]
            unsafe fn from_entry(
                entry: ::core::ptr::NonNull<$crate::list::SinglyLinkedListEntry>,
            ) -> ::core::ptr::NonNull<Self> {
                let offset = ::core::mem::offset_of!($ty, $field);
                ::core::ptr::NonNull::new_unchecked(
                    entry.as_ptr().cast::<u8>().sub(offset).cast::<Self>(),
                )
            }
        }
    };
}
