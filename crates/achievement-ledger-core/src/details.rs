//! Type-dependent details bag.
//!
//! Every modeled field is optional and none are validated against the
//! achievement type, so a competition can carry publication fields. On the
//! wire the groups are flattened into a single object next to
//! `custom_fields`, whose values are arbitrary JSON and round-trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{AchievementType, CompetitionLevel, PublicationType};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompetitionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition_level: Option<CompetitionLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medal_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublicationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_type: Option<PublicationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issn: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrganizationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertificationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_number: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub valid_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommonFields {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub event_date: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AchievementDetails {
    #[serde(flatten)]
    pub competition: CompetitionFields,
    #[serde(flatten)]
    pub publication: PublicationFields,
    #[serde(flatten)]
    pub organization: OrganizationFields,
    #[serde(flatten)]
    pub certification: CertificationFields,
    #[serde(flatten)]
    pub common: CommonFields,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_fields: Map<String, Value>,
}

/// Borrowed view of the field group that the achievement type models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetailsFacet<'a> {
    Competition(&'a CompetitionFields),
    Publication(&'a PublicationFields),
    Organization(&'a OrganizationFields),
    Certification(&'a CertificationFields),
    Untyped,
}

impl AchievementDetails {
    #[must_use]
    pub fn facet(&self, kind: AchievementType) -> DetailsFacet<'_> {
        match kind {
            AchievementType::Competition => DetailsFacet::Competition(&self.competition),
            AchievementType::Publication => DetailsFacet::Publication(&self.publication),
            AchievementType::Organization => DetailsFacet::Organization(&self.organization),
            AchievementType::Certification => DetailsFacet::Certification(&self.certification),
            AchievementType::Academic | AchievementType::Other => DetailsFacet::Untyped,
        }
    }

    /// Field-level merge: present patch fields overwrite, absent ones are kept.
    /// `custom_fields` merges per key, so keys missing from the patch survive.
    pub fn merge(&mut self, patch: AchievementDetails) {
        let AchievementDetails {
            competition,
            publication,
            organization,
            certification,
            common,
            custom_fields,
        } = patch;

        overlay(&mut self.competition.competition_name, competition.competition_name);
        overlay(&mut self.competition.competition_level, competition.competition_level);
        overlay(&mut self.competition.rank, competition.rank);
        overlay(&mut self.competition.medal_type, competition.medal_type);

        overlay(&mut self.publication.publication_type, publication.publication_type);
        overlay(&mut self.publication.publication_title, publication.publication_title);
        overlay(&mut self.publication.authors, publication.authors);
        overlay(&mut self.publication.publisher, publication.publisher);
        overlay(&mut self.publication.issn, publication.issn);

        overlay(&mut self.organization.organization_name, organization.organization_name);
        overlay(&mut self.organization.position, organization.position);
        overlay(&mut self.organization.period, organization.period);

        overlay(&mut self.certification.certification_name, certification.certification_name);
        overlay(&mut self.certification.issued_by, certification.issued_by);
        overlay(
            &mut self.certification.certification_number,
            certification.certification_number,
        );
        overlay(&mut self.certification.valid_until, certification.valid_until);

        overlay(&mut self.common.event_date, common.event_date);
        overlay(&mut self.common.location, common.location);
        overlay(&mut self.common.organizer, common.organizer);
        overlay(&mut self.common.score, common.score);

        for (key, value) in custom_fields {
            self.custom_fields.insert(key, value);
        }
    }
}

fn overlay<T>(target: &mut Option<T>, patch: Option<T>) {
    if patch.is_some() {
        *target = patch;
    }
}
