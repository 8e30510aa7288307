//! Argument snapshots for tracked calls.
//!
//! The engine stores the full argument list of every invocation and also
//! publishes the first argument on its own, which is what keyed features
//! (and most consumers) cut on. [`CallArgs`] is the small trait that makes
//! both possible for tuples of common arities and for `Vec`-shaped
//! argument lists.

/// An argument list captured at invocation time.
pub trait CallArgs: Clone + Send + Sync + 'static {
    /// Type of the first argument.
    type Head: Clone + Send + Sync + 'static;

    /// The first argument, if the list has one.
    fn head(&self) -> Option<Self::Head>;
}

impl CallArgs for () {
    type Head = ();

    fn head(&self) -> Option<Self::Head> {
        None
    }
}

macro_rules! impl_call_args_for_tuple {
    ($head:ident $(, $tail:ident)*) => {
        impl<$head, $($tail,)*> CallArgs for ($head, $($tail,)*)
        where
            $head: Clone + Send + Sync + 'static,
            $($tail: Clone + Send + Sync + 'static,)*
        {
            type Head = $head;

            fn head(&self) -> Option<Self::Head> {
                Some(self.0.clone())
            }
        }
    };
}

impl_call_args_for_tuple!(A);
impl_call_args_for_tuple!(A, B);
impl_call_args_for_tuple!(A, B, C);
impl_call_args_for_tuple!(A, B, C, D);

impl<T> CallArgs for Vec<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Head = T;

    fn head(&self) -> Option<Self::Head> {
        self.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_args_have_no_head() {
        assert_eq!(().head(), None);
    }

    #[test]
    fn tuple_head_is_the_first_element() {
        assert_eq!((42_u32,).head(), Some(42));
        assert_eq!((7_u32, "seven").head(), Some(7));
        assert_eq!(("id", 1_u8, true, 0.5_f64).head(), Some("id"));
    }

    #[test]
    fn vec_head_follows_emptiness() {
        let empty: Vec<u32> = Vec::new();
        assert_eq!(empty.head(), None);
        assert_eq!(vec![3_u32, 1].head(), Some(3));
    }
}
