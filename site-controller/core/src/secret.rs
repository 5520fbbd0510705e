use crate::k8s::{ByteString, ResourceExt, Secret};

/// Accessors for the labels, annotations and data of artifact secrets.
pub trait SecretExt {
    fn label(&self, key: &str) -> Option<&str>;

    fn annotation(&self, key: &str) -> Option<&str>;

    fn data_bytes(&self, key: &str) -> Option<&[u8]>;

    fn set_label(&mut self, key: &str, value: impl Into<String>);

    fn set_annotation(&mut self, key: &str, value: impl Into<String>);

    fn set_data(&mut self, key: &str, value: impl Into<Vec<u8>>);

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data_bytes(key)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

impl SecretExt for Secret {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    fn data_bytes(&self, key: &str) -> Option<&[u8]> {
        self.data.as_ref()?.get(key).map(|ByteString(b)| b.as_slice())
    }

    fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels_mut().insert(key.to_string(), value.into());
    }

    fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations_mut().insert(key.to_string(), value.into());
    }

    fn set_data(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.data
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), ByteString(value.into()));
    }
}

/// Returns an empty secret with the given name.
pub(crate) fn named(name: impl Into<String>) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.into());
    secret
}
