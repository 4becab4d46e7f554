//! Death message parsing
//!
//! Quake 2 announces kills as medium-level prints. Names may contain
//! spaces, so both victim and attacker are matched against the live
//! player names rather than split on whitespace.

use crate::players::PlayerTable;

/// A parsed death message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obituary {
    pub victim: u8,
    /// `None` for suicides and environment deaths
    pub attacker: Option<u8>,
    pub means: &'static str,
}

/// `<victim> <phrase> <attacker><suffix>`
const KILLS: &[(&str, &str, &str)] = &[
    ("was blasted by", "", "blaster"),
    ("was gunned down by", "", "shotgun"),
    ("was blown away by", "'s super shotgun", "super shotgun"),
    ("was machinegunned by", "", "machinegun"),
    ("was cut in half by", "'s chaingun", "chaingun"),
    ("was popped by", "'s grenade", "grenade"),
    ("was shredded by", "'s shrapnel", "grenade"),
    ("ate", "'s rocket", "rocket"),
    ("almost dodged", "'s rocket", "rocket"),
    ("was melted by", "'s hyperblaster", "hyperblaster"),
    ("was railed by", "", "railgun"),
    ("saw the pretty lights from", "'s BFG", "bfg"),
    ("was disintegrated by", "'s BFG blast", "bfg"),
    ("couldn't hide from", "'s BFG", "bfg"),
    ("caught", "'s handgrenade", "handgrenade"),
    ("didn't see", "'s handgrenade", "handgrenade"),
    ("feels", "'s pain", "hurt"),
    ("tried to invade", "'s personal space", "telefrag"),
    ("was caught by", "'s grapple", "grapple"),
];

/// `<victim> <phrase>.`
const DEATHS: &[(&str, &str)] = &[
    ("suicides", "suicide"),
    ("cratered", "falling"),
    ("was squished", "crush"),
    ("sank like a rock", "water"),
    ("melted", "slime"),
    ("does a back flip into the lava", "lava"),
    ("blew up", "explosive"),
    ("found a way out", "exit"),
    ("saw the light", "laser"),
    ("got blasted", "blaster"),
    ("was in the wrong place", "trigger"),
    ("tried to put the pin back in", "handgrenade"),
    ("tripped on his own grenade", "grenade"),
    ("tripped on her own grenade", "grenade"),
    ("tripped on its own grenade", "grenade"),
    ("blew himself up", "rocket"),
    ("blew herself up", "rocket"),
    ("blew itself up", "rocket"),
    ("should have used a smaller gun", "bfg"),
    ("killed himself", "suicide"),
    ("killed herself", "suicide"),
    ("killed itself", "suicide"),
    ("died", "unknown"),
];

/// Recognise a stock death message, or `None` for any other print
pub fn parse(players: &PlayerTable, text: &str) -> Option<Obituary> {
    let text = text.trim_end();
    let (victim, rest) = players.name_prefix(text)?;
    let rest = rest.strip_prefix(' ')?;

    if let Some(phrase) = rest.strip_suffix('.') {
        if let Some(&(_, means)) = DEATHS.iter().find(|(p, _)| *p == phrase) {
            return Some(Obituary {
                victim,
                attacker: None,
                means,
            });
        }
    }

    for &(phrase, suffix, means) in KILLS {
        let Some(tail) = rest
            .strip_prefix(phrase)
            .and_then(|t| t.strip_prefix(' '))
            .and_then(|t| t.strip_suffix(suffix))
        else {
            continue;
        };
        if let Some((attacker, "")) = players.name_prefix(tail) {
            return Some(Obituary {
                victim,
                attacker: Some(attacker),
                means,
            });
        }
    }
    None
}
