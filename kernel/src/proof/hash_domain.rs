//! Typed domain separators for canonical hashing.
//!
//! Every hash the engine computes selects a domain via [`HashDomain`], so a
//! patch digest can never collide with a checkpoint chain link computed over
//! the same bytes. Adding a domain is a single change to the macro invocation
//! below; the enum, `as_bytes()`, `ALL`, and `Display` are generated together.

/// Declares `HashDomain` enum, `as_bytes()`, `ALL`, and `Display` from one list.
macro_rules! define_hash_domains {
    (
        $(
            $(#[$meta:meta])*
            $variant:ident => $bytes:expr
        ),+ $(,)?
    ) => {
        /// Typed domain separator for [`super::hash::canonical_hash`].
        ///
        /// Every variant maps to a unique, null-terminated byte string used as
        /// a SHA-256 prefix.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HashDomain {
            $(
                $(#[$meta])*
                $variant,
            )+
        }

        impl HashDomain {
            /// The raw domain-separator bytes (null-terminated).
            #[must_use]
            pub const fn as_bytes(&self) -> &'static [u8] {
                match self {
                    $( Self::$variant => $bytes, )+
                }
            }

            /// All domain variants in declaration order.
            pub const ALL: &[HashDomain] = &[
                $( Self::$variant, )+
            ];
        }

        impl core::fmt::Display for HashDomain {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $( Self::$variant => write!(f, stringify!($variant)), )+
                }
            }
        }
    };
}

define_hash_domains! {
    // -----------------------------------------------------------------------
    // Patch identity
    // -----------------------------------------------------------------------

    /// Patch content digest (bytes + canonical metadata). Node ids derive from it.
    PatchContent => b"PATCHTREE::PATCH_CONTENT::V1\0",

    /// Problem statement reference digest recorded on each session.
    ProblemStatement => b"PATCHTREE::PROBLEM_STATEMENT::V1\0",

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint header hashing (chain seed).
    Checkpoint => b"PATCHTREE::CHECKPOINT::V1\0",

    /// Checkpoint chain step hashing.
    CheckpointChain => b"PATCHTREE::CHECKPOINT_CHAIN::V1\0",

    // -----------------------------------------------------------------------
    // Benchmarks
    // -----------------------------------------------------------------------

    /// Benchmark input hashing.
    BenchInput => b"PATCHTREE::BENCH_INPUT::V1\0",
}
