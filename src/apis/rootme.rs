//! Root-Me challenge platform API.
//!
//! Authentication is an `api_key` cookie. Every endpoint returns the JSON
//! payload on 200 and a domain error otherwise.
//!
//! | name           | route                            | filters                          |
//! |----------------|----------------------------------|----------------------------------|
//! | `challenges`   | `/challenges`                    | titre, soustitre, lang, score, id_auteur[] |
//! | `challenge`    | `/challenges/{id_challenge}`     |                                  |
//! | `authors`      | `/auteurs`                       | nom, statut, lang                |
//! | `author`       | `/auteurs/{id_author}`           |                                  |
//! | `leaderboard`  | `/classement`                    | debut_classement                 |
//! | `environments` | `/environnements_virtuels`       | nom, os                          |
//! | `environment`  | `/environnements_virtuels/{id_env}` |                               |

use crate::api::Api;
use crate::config::ClientConfig;
use crate::endpoint::{EndpointRegistry, EndpointSpec, expect_ok};
use crate::error::Result;
use crate::runtime::Runtime;
use crate::settings::Settings;

pub const NAME: &str = "rootme";
pub const BASE_URL: &str = "https://api.www.root-me.org";
pub const API_KEY_ENV: &str = "ROOTME_API_KEY";
pub const API_KEY_SETTING: &str = "rootme_key";

pub fn endpoints() -> EndpointRegistry {
    EndpointRegistry::new()
        .with(EndpointSpec::get("challenges", "/challenges", expect_ok("challenges")))
        .with(EndpointSpec::get(
            "challenge",
            "/challenges/{id_challenge}",
            expect_ok("challenge"),
        ))
        .with(EndpointSpec::get("authors", "/auteurs", expect_ok("authors")))
        .with(EndpointSpec::get("author", "/auteurs/{id_author}", expect_ok("author")))
        .with(EndpointSpec::get("leaderboard", "/classement", expect_ok("leaderboard")))
        .with(EndpointSpec::get(
            "environments",
            "/environnements_virtuels",
            expect_ok("virtual environments"),
        ))
        .with(EndpointSpec::get(
            "environment",
            "/environnements_virtuels/{id_env}",
            expect_ok("virtual environment"),
        ))
}

pub fn config(api_key: &str) -> ClientConfig {
    ClientConfig::new(NAME, BASE_URL).with_cookie("api_key", api_key)
}

/// An [`Api`] with every Root-Me endpoint declared.
pub fn client(config: ClientConfig) -> Api {
    Api::new(config).with_endpoints(endpoints())
}

/// Builds the client, taking the key from `api_key`, else the environment, else settings.
pub fn setup<R: Runtime>(settings: &Settings<R>, api_key: Option<&str>) -> Result<Api> {
    let key = match api_key {
        Some(key) => key.to_string(),
        None => settings.secret(API_KEY_ENV, API_KEY_SETTING)?,
    };
    Ok(client(config(&key)))
}
