use sqlx::{Postgres, QueryBuilder};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

/// One page of the failure archive of a queue.
pub(crate) struct FailedJobsQuery<'a> {
    pub queue: &'a str,
    pub limit: u32,
    pub offset: u32,
}

impl ToQuery for FailedJobsQuery<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT * FROM hopper_failed_jobs WHERE queue = ");
        builder.push_bind(self.queue);
        builder.push(" ORDER BY failed_at DESC, id DESC LIMIT ");
        builder.push_bind(i64::from(self.limit));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(self.offset));
        builder
    }
}

/// Registered workers, optionally only those of one queue.
pub(crate) struct WorkersQuery<'a> {
    pub queue: Option<&'a str>,
}

impl ToQuery for WorkersQuery<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT * FROM hopper_workers");
        if let Some(queue) = self.queue {
            builder.push(" WHERE queue = ");
            builder.push_bind(queue);
        }
        builder.push(" ORDER BY started_at, worker_id");
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failed_jobs_query() {
        let query = FailedJobsQuery {
            queue: "default",
            limit: 10,
            offset: 20,
        };

        assert_eq!(
            query.query().into_sql(),
            "SELECT * FROM hopper_failed_jobs WHERE queue = $1 ORDER BY failed_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
    }

    #[test]
    fn workers_query_for_all_queues() {
        let query = WorkersQuery { queue: None };

        assert_eq!(
            query.query().into_sql(),
            "SELECT * FROM hopper_workers ORDER BY started_at, worker_id"
        );
    }

    #[test]
    fn workers_query_for_one_queue() {
        let query = WorkersQuery {
            queue: Some("emails"),
        };

        assert_eq!(
            query.query().into_sql(),
            "SELECT * FROM hopper_workers WHERE queue = $1 ORDER BY started_at, worker_id"
        );
    }
}
