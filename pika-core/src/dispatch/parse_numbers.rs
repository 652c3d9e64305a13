use std::str;

pub(super) fn parse_redis_i64(payload: &[u8]) -> Result<i64, ()> {
    let Ok(text) = str::from_utf8(payload) else {
        return Err(());
    };
    text.parse::<i64>().map_err(|_| ())
}

pub(super) fn parse_redis_f64(payload: &[u8]) -> Result<f64, ()> {
    let Ok(text) = str::from_utf8(payload) else {
        return Err(());
    };
    match text.parse::<f64>() {
        Ok(value) if !value.is_nan() => Ok(value),
        _ => Err(()),
    }
}
