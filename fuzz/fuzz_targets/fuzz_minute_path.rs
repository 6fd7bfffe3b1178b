//! Fuzz target for minute path parsing and arithmetic.

#![no_main]

use hub_reconciler::model::MinutePath;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, i16)| {
    let (url, minutes) = data;
    let Some(path) = MinutePath::from_url(url) else {
        return;
    };

    assert_eq!(MinutePath::from_url(&path.to_url()), Some(path));
    assert_eq!(MinutePath::from_ordinal(path.ordinal()), Some(path));

    let moved = path.plus_minutes(minutes as i64);
    assert_eq!(moved.ordinal() - path.ordinal(), minutes as i64);
    assert_eq!(moved.minus_minutes(minutes as i64), path);
});
