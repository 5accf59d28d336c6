//! Create and check test objects in S3-compatible object storage
use crate::Result;
use bytes::Bytes;
use futures::StreamExt;
use rand::prelude::*;
use s3lite::S3Client;
use sha2::Digest;
use std::collections::HashMap;

/// Max concurrent S3 operations when dealing with test data
const MAX_CONCURRENCY: usize = 10;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key: key.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A [`TestObject`] that has been written, along with what was written
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Bytes,
    pub hash: [u8; 32],
}

/// Upload random data for each of `objects` to `bucket`, a few at a time.
///
/// Returns what was written, keyed by object key.
pub async fn make_test_data(
    client: &S3Client,
    bucket: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> Result<HashMap<String, TestObjectWithData>> {
    let uploads = objects.into_iter().map(|object| async move {
        let data = random_data(object.size);

        client
            .put_object(bucket, &object.key, data.clone(), None)
            .await?;

        Result::<_>::Ok(TestObjectWithData {
            hash: sha256(&data),
            key: object.key,
            data,
        })
    });

    let mut uploads = futures::stream::iter(uploads).buffer_unordered(MAX_CONCURRENCY);
    let mut test_objects = HashMap::new();

    while let Some(result) = uploads.next().await {
        let object = result?;
        let key = object.key.clone();

        assert!(
            test_objects.insert(key.clone(), object).is_none(),
            "BUG: test data contains the same key '{key}' more than once"
        );
    }

    Ok(test_objects)
}

/// Read every object in `test_data` back from `bucket` and check it has the expected contents
pub async fn validate_test_data(
    client: &S3Client,
    bucket: &str,
    test_data: &HashMap<String, TestObjectWithData>,
) -> Result<()> {
    for (key, expected) in test_data {
        let response = client.get_object(bucket, key).await?;

        assert_eq!(
            response.body().len(),
            expected.data.len(),
            "object '{key}' has the wrong size"
        );
        assert_eq!(
            hex::encode(sha256(response.body())),
            hex::encode(expected.hash),
            "object '{key}' has the wrong contents"
        );
    }

    Ok(())
}

pub fn random_data(size: usize) -> Bytes {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);

    Bytes::from(data)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha2::Sha256::digest(data).into()
}
