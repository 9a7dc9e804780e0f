//! Hash domain governance lock tests.
//!
//! Proves:
//! 1. Canonical domain set has expected count (catches forgotten additions)
//! 2. All domain byte strings are unique and null-terminated
//! 3. No raw `PATCHTREE::` domain literals in production source outside `hash_domain.rs`
//! 4. Node ids and checkpoint chains use different domains over the same bytes

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::canonical_hash;
use patchtree_kernel::proof::hash_domain::HashDomain;

// ---------------------------------------------------------------------------
// 1. Canonical set count
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_canonical_set_count() {
    assert_eq!(
        HashDomain::ALL.len(),
        5,
        "expected 5 domain variants; if you added a new domain, update this count"
    );
}

// ---------------------------------------------------------------------------
// 2. Unique, null-terminated
// ---------------------------------------------------------------------------

#[test]
fn hash_domain_bytes_unique_and_terminated() {
    let mut seen = BTreeSet::new();
    for domain in HashDomain::ALL {
        assert!(
            seen.insert(domain.as_bytes()),
            "duplicate domain bytes: {domain}"
        );
        assert!(
            domain.as_bytes().ends_with(&[0]),
            "{domain} is not null-terminated"
        );
    }
}

// ---------------------------------------------------------------------------
// 3. No raw PATCHTREE:: domain literals in production source
// ---------------------------------------------------------------------------

/// Scan kernel/, search/, harness/ source for `b"PATCHTREE::` literals.
/// The only file allowed to contain them is `hash_domain.rs`.
#[test]
fn no_raw_domain_literals_outside_authority() {
    let production_dirs = [
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../kernel/src"),
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../search/src"),
        concat!(env!("CARGO_MANIFEST_DIR"), "/../../harness/src"),
    ];

    let pattern = "b\"PATCHTREE::";
    let authority_file = "hash_domain.rs";
    let mut violations = Vec::new();
    let mut scanned = 0usize;

    for dir in &production_dirs {
        for path in rust_files(Path::new(dir)) {
            scanned += 1;
            if path.file_name().and_then(|n| n.to_str()) == Some(authority_file) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (i, line) in content.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.starts_with("//") {
                    continue;
                }
                if trimmed.contains(pattern) {
                    violations.push(format!("  {}:{}: {}", path.display(), i + 1, trimmed));
                }
            }
        }
    }

    assert!(scanned > 10, "source scan found only {scanned} files");
    assert!(
        violations.is_empty(),
        "raw PATCHTREE:: domain literals found outside {authority_file}:\n{}",
        violations.join("\n")
    );
}

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                results.extend(rust_files(&path));
            } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
                results.push(path);
            }
        }
    }
    results
}

// ---------------------------------------------------------------------------
// 4. Domain separation in practice
// ---------------------------------------------------------------------------

#[test]
fn same_bytes_hash_differently_per_domain() {
    let bytes = b"fix: guard empty slice";
    let digests: BTreeSet<_> = HashDomain::ALL
        .iter()
        .map(|domain| canonical_hash(*domain, bytes))
        .collect();
    assert_eq!(digests.len(), HashDomain::ALL.len());
}

#[test]
fn patch_digest_covers_metadata() {
    let bare = Patch::from("--- a/x\n+++ b/x\n");
    let tagged = bare.clone().meta("origin", "generator-7");
    assert_ne!(bare.content_hash(), tagged.content_hash());
    assert_eq!(
        tagged.content_hash(),
        Patch::from("--- a/x\n+++ b/x\n")
            .meta("origin", "generator-7")
            .content_hash()
    );
}
