//! Wire types of the analyzer, tagger and publisher services.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
pub struct AnalyzeRequest<'a> {
    pub url: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct AnalyzeResponse {
    pub assetid: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TagResponse {
    #[serde(rename = "assetId")]
    pub asset_id: Option<String>,
    pub keywords: Option<LanguageList>,
    pub persons: Option<Persons>,
    #[serde(rename = "clientCustomProperties")]
    pub client_custom_properties: Option<CustomProperties>,
}

#[derive(Deserialize, Debug, Default)]
pub struct LanguageList {
    #[serde(default)]
    pub deu: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Persons {
    #[serde(default)]
    pub mntd: Vec<Mention>,
}

#[derive(Deserialize, Debug)]
pub struct Mention {
    #[serde(rename = "perLanguage")]
    pub per_language: Option<LanguageValue>,
}

#[derive(Deserialize, Debug)]
pub struct LanguageValue {
    pub deu: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CustomProperties {
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Deserialize, Debug)]
pub struct Topic {
    pub name: String,
}

/// Keywords returned by the tagger for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSet {
    pub keywords: BTreeSet<String>,
    pub organizations: BTreeSet<String>,
    pub topics: BTreeSet<String>,
}

impl KeywordSet {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.organizations.is_empty() && self.topics.is_empty()
    }

    /// Keywords, then organisations, then topics, comma-joined.
    pub fn to_keyword_string(&self) -> String {
        self.keywords
            .iter()
            .chain(self.organizations.iter())
            .chain(self.topics.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl From<TagResponse> for KeywordSet {
    fn from(resp: TagResponse) -> Self {
        let clean = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        let mut set = KeywordSet::default();
        if let Some(list) = resp.keywords {
            set.keywords.extend(list.deu.iter().filter_map(|k| clean(k.as_str())));
        }
        if let Some(persons) = resp.persons {
            set.organizations.extend(
                persons
                    .mntd
                    .iter()
                    .filter_map(|m| m.per_language.as_ref()?.deu.as_deref())
                    .filter_map(clean),
            );
        }
        if let Some(props) = resp.client_custom_properties {
            for topic in &props.topics {
                set.topics.extend(topic.name.split('/').filter_map(clean));
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_response_maps_all_groups() {
        let raw = r#"{
            "assetId": "escenic-1",
            "keywords": {"deu": ["Wahl", "Berlin", "Wahl"]},
            "persons": {"mntd": [{"perLanguage": {"deu": "SPD"}}, {"perLanguage": null}]},
            "clientCustomProperties": {"topics": [{"name": "Politik/Inland"}]}
        }"#;
        let resp: TagResponse = serde_json::from_str(raw).unwrap();
        let set = KeywordSet::from(resp);
        assert_eq!(set.keywords.len(), 2);
        assert!(set.organizations.contains("SPD"));
        assert_eq!(set.to_keyword_string(), "Berlin,Wahl,SPD,Inland,Politik");
    }

    #[test]
    fn missing_groups_are_empty() {
        let resp: TagResponse = serde_json::from_str("{}").unwrap();
        let set = KeywordSet::from(resp);
        assert!(set.is_empty());
        assert_eq!(set.to_keyword_string(), "");
    }
}
