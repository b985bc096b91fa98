// `WITHSCORES` replies come back flat, as member, score, member,
// score...  and the scores are rendered as doubles, so we have to
// parse them manually.
#[derive(Debug)]
pub(crate) struct ScoredMembers {
    pub members: Vec<(String, i64)>,
}

impl redis::FromRedisValue for ScoredMembers {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        fn error(detail: String) -> redis::RedisError {
            redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "unexpected reply from server while reading scores",
                detail,
            ))
        }

        #[allow(clippy::cast_possible_truncation)]
        fn score(raw: &str) -> redis::RedisResult<i64> {
            raw.parse::<i64>()
                .or_else(|_| raw.parse::<f64>().map(|score| score.floor() as i64))
                .map_err(|_| error(format!("invalid score {raw:?}")))
        }

        let flat: Vec<String> = redis::FromRedisValue::from_redis_value(v)?;
        if flat.len() % 2 != 0 {
            return Err(error(format!("odd number of elements ({})", flat.len())));
        }

        let mut members = Vec::with_capacity(flat.len() / 2);
        let mut flat = flat.into_iter();
        while let (Some(member), Some(raw)) = (flat.next(), flat.next()) {
            members.push((member, score(&raw)?));
        }

        Ok(Self { members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::FromRedisValue as _;

    fn bulk(items: &[&str]) -> redis::Value {
        redis::Value::Bulk(
            items
                .iter()
                .map(|item| redis::Value::Data(item.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn parses_flat_pairs() {
        let reply = ScoredMembers::from_redis_value(&bulk(&["a", "1700000000", "b", "1.7e9"]))
            .expect("valid reply");

        assert_eq!(
            reply.members,
            vec![("a".to_owned(), 1_700_000_000), ("b".to_owned(), 1_700_000_000)]
        );
    }

    #[test]
    fn empty_reply_is_empty() {
        let reply = ScoredMembers::from_redis_value(&bulk(&[])).expect("valid reply");
        assert!(reply.members.is_empty());
    }

    #[test]
    fn rejects_dangling_member() {
        assert!(ScoredMembers::from_redis_value(&bulk(&["a", "1", "b"])).is_err());
        assert!(ScoredMembers::from_redis_value(&bulk(&["a", "soon"])).is_err());
    }
}
