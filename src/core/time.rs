use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, PrimitiveDateTime};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn plus_std(value: PrimitiveDateTime, delta: std::time::Duration) -> PrimitiveDateTime {
    value + Duration::seconds_f64(delta.as_secs_f64())
}

pub(crate) fn minus_secs(value: PrimitiveDateTime, seconds: u64) -> PrimitiveDateTime {
    value - Duration::seconds(seconds.min(i64::MAX as u64) as i64)
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}
