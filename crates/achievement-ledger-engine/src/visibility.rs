//! Which owners an actor may see, and statistics scoped to them.

use std::collections::BTreeMap;

use achievement_ledger_core::{
    AchievementError, AchievementStatistics, AchievementType, Actor, AggregateBucket,
    AggregateDimension, AggregateFilter, PeriodCount, RequestScope, Role, StudentId,
    StudentStatistics, TopStudent,
};

use crate::{store_call, LifecycleEngine};

const TOP_STUDENTS_LIMIT: usize = 10;

impl LifecycleEngine {
    /// Self for a student, advisees for an advisor, every student for an admin.
    pub fn visible_owners(
        &self,
        scope: &RequestScope,
        actor: &Actor,
    ) -> Result<Vec<StudentId>, AchievementError> {
        match actor.role {
            Role::Student(student_id) => Ok(vec![student_id]),
            Role::Advisor(advisor_id) => store_call(scope, "list advisees", || {
                self.identity.advisees(advisor_id)
            }),
            Role::Admin => store_call(scope, "list students", || self.identity.all_students()),
        }
    }

    pub fn statistics(
        &self,
        scope: &RequestScope,
        actor: &Actor,
    ) -> Result<AchievementStatistics, AchievementError> {
        let owners = self.visible_owners(scope, actor)?;
        self.aggregate_statistics(scope, owners)
    }

    pub fn student_statistics(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        student_id: StudentId,
    ) -> Result<StudentStatistics, AchievementError> {
        match actor.role {
            Role::Student(own_id) if own_id == student_id => {}
            Role::Student(_) => {
                return Err(AchievementError::Forbidden(
                    "students may only view their own statistics".to_string(),
                ));
            }
            Role::Advisor(advisor_id) => {
                if !store_call(scope, "check advisor", || {
                    self.identity.is_advisor_of(advisor_id, student_id)
                })? {
                    return Err(AchievementError::Forbidden(format!(
                        "advisor is not assigned to student {student_id}"
                    )));
                }
            }
            Role::Admin => {}
        }

        let student = store_call(scope, "load student profile", || {
            self.identity.student_profiles(&[student_id])
        })?
        .into_iter()
        .next()
        .ok_or_else(|| AchievementError::NotFound(format!("student {student_id} not found")))?;

        let documents = store_call(scope, "list owner documents", || {
            self.documents.list_by_owner(student_id)
        })?;
        let total_points = documents.iter().map(|document| document.fields.points).sum::<f64>();
        let total_achievements = u64::try_from(documents.len()).unwrap_or(u64::MAX);

        let statistics = self.aggregate_statistics(scope, vec![student_id])?;
        Ok(StudentStatistics {
            student,
            total_points,
            total_achievements,
            statistics,
        })
    }

    fn aggregate_statistics(
        &self,
        scope: &RequestScope,
        owners: Vec<StudentId>,
    ) -> Result<AchievementStatistics, AchievementError> {
        if owners.is_empty() {
            return Ok(AchievementStatistics::default());
        }

        let all = AggregateFilter {
            owners,
            achievement_type: None,
        };
        let aggregate = |operation: &str, filter: &AggregateFilter, dimension| {
            store_call(scope, operation, || self.documents.aggregate(filter, dimension))
        };

        let by_type = aggregate("aggregate by type", &all, AggregateDimension::Type)?;
        let by_period = aggregate("aggregate by period", &all, AggregateDimension::Month)?;
        let by_owner = aggregate(
            "aggregate by owner",
            &all,
            AggregateDimension::Owner {
                limit: TOP_STUDENTS_LIMIT,
            },
        )?;
        let competitions = AggregateFilter {
            owners: all.owners.clone(),
            achievement_type: Some(AchievementType::Competition),
        };
        let by_level = aggregate(
            "aggregate by competition level",
            &competitions,
            AggregateDimension::CompetitionLevel,
        )?;

        let mut total_by_period: Vec<PeriodCount> = by_period
            .into_iter()
            .map(|bucket| PeriodCount {
                period: bucket.key,
                count: bucket.count,
            })
            .collect();
        total_by_period.sort_by(|left, right| right.period.cmp(&left.period));

        Ok(AchievementStatistics {
            total_by_type: counts_by_key(by_type),
            total_by_period,
            top_students: self.top_students(scope, by_owner),
            competition_level_distribution: counts_by_key(by_level),
        })
    }

    fn top_students(&self, scope: &RequestScope, buckets: Vec<AggregateBucket>) -> Vec<TopStudent> {
        let ranked: Vec<(StudentId, AggregateBucket)> = buckets
            .into_iter()
            .filter_map(|bucket| match StudentId::parse(&bucket.key) {
                Ok(owner_id) => Some((owner_id, bucket)),
                Err(err) => {
                    tracing::warn!(
                        key = %bucket.key,
                        error = %err,
                        "skipping unparseable owner bucket"
                    );
                    None
                }
            })
            .collect();

        let owner_ids: Vec<StudentId> = ranked.iter().map(|(owner_id, _)| *owner_id).collect();
        let profiles = self.owner_profiles(scope, &owner_ids);

        ranked
            .into_iter()
            .map(|(owner_id, bucket)| TopStudent {
                owner_id,
                full_name: profiles.get(&owner_id).map(|profile| profile.full_name.clone()),
                total_points: bucket.total_points,
                achievement_count: bucket.count,
            })
            .collect()
    }
}

fn counts_by_key(buckets: Vec<AggregateBucket>) -> BTreeMap<String, u64> {
    buckets
        .into_iter()
        .map(|bucket| (bucket.key, bucket.count))
        .collect()
}
