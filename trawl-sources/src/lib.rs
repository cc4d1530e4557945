//! Provider adapters for the trawl fabric. Each module exposes a single
//! `source()` constructor returning the provider's capability record with
//! its dispatcher attached; the fabric never needs to know which provider
//! it is driving.

use trawl_core::source::Source;

pub mod anubis;
pub mod bevigil;
pub mod censys;
pub mod commoncrawl;
pub mod crtsh;
pub mod dnsdb;
pub mod dnsdumpster;
pub mod fullhunt;
pub mod github;
pub mod hackertarget;
pub mod hunter;
pub mod rapiddns;
pub mod securitytrails;
pub mod shodan;
pub mod whoisxmlapi;
pub mod zoomeyeapi;

/// The full roster, in canonical-name order.
pub fn all_sources() -> Vec<Source> {
    vec![
        anubis::source(),
        bevigil::source(),
        censys::source(),
        commoncrawl::source(),
        crtsh::source(),
        dnsdb::source(),
        dnsdumpster::source(),
        fullhunt::source(),
        github::source(),
        hackertarget::source(),
        hunter::source(),
        rapiddns::source(),
        securitytrails::source(),
        shodan::source(),
        whoisxmlapi::source(),
        zoomeyeapi::source(),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roster_names_are_unique_and_lowercase() {
        let sources = all_sources();
        let mut names: Vec<&str> =
            sources.iter().map(|source| source.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
        for name in names {
            assert_eq!(name, name.to_lowercase());
        }
    }

    #[test]
    fn keyed_sources_start_with_missing_keys() {
        for source in all_sources() {
            assert_eq!(
                source.missing_keys(),
                source.needs_key,
                "source {}",
                source.name
            );
        }
    }
}
