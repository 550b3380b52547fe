//! Random subdomain allocation
//!
//! Names look like `brave-fox-3f2a`. No collision handling here: the
//! namespace is large for a single-user deployment and the registry's
//! uniqueness check is the authoritative guard; callers allocate again on the
//! rare clash.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "brisk", "calm", "clever", "crisp", "eager", "fuzzy", "gentle",
    "glad", "happy", "keen", "lively", "lucky", "mellow", "noble", "proud", "quiet", "rapid",
    "sly", "sunny", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "bear", "crane", "deer", "falcon", "ferret", "finch", "fox", "hare", "heron",
    "lark", "lynx", "marten", "mole", "otter", "owl", "panda", "raven", "robin", "seal",
    "stoat", "swan", "vole", "wren",
];

/// Pick a fresh `adjective-noun-hex4` subdomain.
pub fn allocate() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap();
    let noun = NOUNS.choose(&mut rng).unwrap();
    let suffix: u16 = rng.gen();
    format!("{}-{}-{:04x}", adjective, noun, suffix)
}
