use std::cell::Cell;
use std::marker;
use std::thread::LocalKey;

/// Declares a thread-local storage key of type `ScopedLocalKey<T>` which can
/// hold a reference to a `T` for the duration of a closure.
///
/// The key is used by the kernel to publish the timestamp and context of the
/// event being invoked, e.g. for log timestamping.
macro_rules! scoped_thread_local {
    ($(#[$attrs:meta])* $vis:vis static $name:ident: $ty:ty) => (
        $(#[$attrs])*
        $vis static $name: $crate::macros::scoped_thread_local::ScopedLocalKey<$ty>
            = unsafe {
                ::std::thread_local!(static SLOT: ::std::cell::Cell<*const ()> = const {
                        ::std::cell::Cell::new(::std::ptr::null())
                });
                $crate::macros::scoped_thread_local::ScopedLocalKey::new(&SLOT)
            };
    )
}
pub(crate) use scoped_thread_local;

/// Thread-local storage key holding an optional reference to a `T`.
pub(crate) struct ScopedLocalKey<T> {
    inner: &'static LocalKey<Cell<*const ()>>,
    _marker: marker::PhantomData<T>,
}

unsafe impl<T> Sync for ScopedLocalKey<T> {}

impl<T> ScopedLocalKey<T> {
    #[doc(hidden)]
    /// # Safety
    ///
    /// Should only be called through the public macro.
    pub(crate) const unsafe fn new(inner: &'static LocalKey<Cell<*const ()>>) -> Self {
        Self {
            inner,
            _marker: marker::PhantomData,
        }
    }

    /// Makes `t` visible through this key for the duration of a closure.
    ///
    /// The previous value is restored on exit, including on unwinding.
    pub(crate) fn set<F, R>(&'static self, t: &T, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        struct Reset {
            key: &'static LocalKey<Cell<*const ()>>,
            val: *const (),
        }

        impl Drop for Reset {
            fn drop(&mut self) {
                self.key.with(|c| c.set(self.val));
            }
        }

        let prev = self.inner.with(|c| c.replace(t as *const _ as *const ()));

        let _reset = Reset {
            key: self.inner,
            val: prev,
        };

        f()
    }

    /// Evaluates a closure with a reference to the current value, or returns
    /// `None` if no value is set.
    pub(crate) fn map<F, R>(&'static self, f: F) -> Option<R>
    where
        F: FnOnce(&T) -> R,
    {
        let val = self.inner.with(|c| c.get());

        if val.is_null() {
            None
        } else {
            // Safety: a non-null pointer was set by `set` from a reference
            // which outlives the closure passed to `set`.
            Some(f(unsafe { &*(val as *const T) }))
        }
    }
}
