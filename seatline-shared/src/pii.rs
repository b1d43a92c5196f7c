use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps customer contact data so it never reaches log output in full.
///
/// `Debug` and `Display` keep only the last three characters; serialization
/// passes the real value through, since API responses need it.
#[derive(Clone, PartialEq, Eq, Hash, Default, Deserialize)]
pub struct Masked<T>(pub T);

impl<T: fmt::Display> Masked<T> {
    fn masked(&self) -> String {
        let raw = self.0.to_string();
        let visible = raw.chars().count().min(3);
        let tail: String = raw.chars().skip(raw.chars().count() - visible).collect();
        format!("******{}", tail)
    }
}

impl<T: fmt::Display> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl<T: fmt::Display> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl From<&str> for Masked<String> {
    fn from(value: &str) -> Self {
        Masked(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_all_but_tail() {
        let phone = Masked::from("0901234567");
        assert_eq!(format!("{:?}", phone), "******567");
        assert_eq!(serde_json::to_string(&phone).unwrap(), "\"0901234567\"");
    }

    #[test]
    fn test_short_values_are_fully_masked_prefix() {
        assert_eq!(Masked::from("12").to_string(), "******12");
    }
}
