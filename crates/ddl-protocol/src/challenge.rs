//! Join challenges: a few random words from the BIP-39 English list.
//!
//! The challenge is shown to the operators of both nodes so they can
//! confirm out-of-band that they are looking at the same request.

use rand::seq::SliceRandom;

pub const DEFAULT_CHALLENGE_WORDS: usize = 3;

pub fn generate_challenge(words: usize) -> Vec<String> {
    let list = bip39::Language::English.word_list();
    let mut rng = rand::thread_rng();
    (0..words)
        .filter_map(|_| list.choose(&mut rng))
        .map(|w| w.to_string())
        .collect()
}

pub fn default_challenge() -> Vec<String> {
    generate_challenge(DEFAULT_CHALLENGE_WORDS)
}
