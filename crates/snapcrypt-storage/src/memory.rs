//! In-process object store
//!
//! Backs tests and the `memory` backend. Listing pages and conditional
//! writes follow the same rules as the cloud stores.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snapcrypt_core::BlobEntry;

use crate::client::{BlobClient, BlobUpload, ClientError, ClientErrorKind, ListPage, Precondition};

const DEFAULT_PAGE_SIZE: usize = 1000;

type ObjectMap = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
pub struct MemoryBlobClient {
    objects: Arc<Mutex<ObjectMap>>,
    page_size: usize,
}

impl Default for MemoryBlobClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Cap entries per listing page (objects plus common prefixes).
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            page_size: page_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Stored bytes exactly as the backend holds them (ciphertext).
    pub fn raw_object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    /// Overwrite stored bytes directly, bypassing preconditions.
    pub fn insert_raw(&self, path: &str, data: Vec<u8>) {
        self.lock().insert(path.to_string(), data);
    }

    fn lock(&self) -> MutexGuard<'_, ObjectMap> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobClient for MemoryBlobClient {
    fn head_object(&self, path: &str) -> Result<Option<u64>, ClientError> {
        Ok(self.lock().get(path).map(|data| data.len() as u64))
    }

    fn get_object(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ClientError::not_found(path))
    }

    fn range_read(&self, path: &str, offset: u64) -> Result<Box<dyn Read + Send>, ClientError> {
        let objects = self.lock();
        let data = objects.get(path).ok_or_else(|| ClientError::not_found(path))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        Ok(Box::new(Cursor::new(data[start..].to_vec())))
    }

    fn put_object(
        &self,
        path: &str,
        precondition: Precondition,
        _size_hint: Option<u64>,
    ) -> Result<Box<dyn BlobUpload>, ClientError> {
        Ok(Box::new(MemoryUpload {
            objects: Arc::clone(&self.objects),
            path: path.to_string(),
            precondition,
            buf: Vec::new(),
        }))
    }

    fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<&str>,
    ) -> Result<ListPage, ClientError> {
        let objects = self.lock();
        let start = match token {
            Some(t) => Bound::Excluded(t.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        // A token ending in the delimiter is a prefix already emitted whole.
        let emitted_prefix = token.filter(|t| delimiter.is_some_and(|d| t.ends_with(d)));

        let mut page = ListPage::default();
        let mut last: Option<String> = None;
        for (name, data) in objects.range::<String, _>((start, Bound::Unbounded)) {
            if !name.starts_with(prefix) {
                break;
            }
            if emitted_prefix.is_some_and(|p| name.starts_with(p)) {
                continue;
            }
            let rest = &name[prefix.len()..];
            let common = delimiter
                .and_then(|d| rest.find(d).map(|i| format!("{prefix}{}", &rest[..i + d.len()])));
            if common.is_some() && page.common_prefixes.last() == common.as_ref() {
                continue;
            }
            if page.objects.len() + page.common_prefixes.len() >= self.page_size {
                page.next_token = last;
                break;
            }
            match common {
                Some(common) => {
                    last = Some(common.clone());
                    page.common_prefixes.push(common);
                }
                None => {
                    last = Some(name.clone());
                    page.objects.push(BlobEntry {
                        name: name.clone(),
                        size_bytes: data.len() as u64,
                    });
                }
            }
        }
        Ok(page)
    }

    fn delete_objects(&self, paths: &[String]) -> Vec<(String, Result<(), ClientError>)> {
        let mut objects = self.lock();
        paths
            .iter()
            .map(|path| {
                let outcome = match objects.remove(path) {
                    Some(_) => Ok(()),
                    None => Err(ClientError::not_found(path)),
                };
                (path.clone(), outcome)
            })
            .collect()
    }
}

struct MemoryUpload {
    objects: Arc<Mutex<ObjectMap>>,
    path: String,
    precondition: Precondition,
    buf: Vec<u8>,
}

impl Write for MemoryUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobUpload for MemoryUpload {
    fn commit(self: Box<Self>) -> Result<(), ClientError> {
        let shared = Arc::clone(&self.objects);
        let mut objects = shared.lock().unwrap_or_else(PoisonError::into_inner);
        if self.precondition == Precondition::IfNotExists && objects.contains_key(&self.path) {
            return Err(ClientError::new(
                ClientErrorKind::PreconditionFailed,
                format!("{}: object already exists", self.path),
            ));
        }
        let MemoryUpload { path, buf, .. } = *self;
        objects.insert(path, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(page_size: usize, names: &[&str]) -> MemoryBlobClient {
        let client = MemoryBlobClient::with_page_size(page_size);
        for name in names {
            client.insert_raw(name, name.as_bytes().to_vec());
        }
        client
    }

    fn drain(
        client: &MemoryBlobClient,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> (Vec<String>, Vec<String>, usize) {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut pages = 0;
        let mut token: Option<String> = None;
        loop {
            let page = client
                .list_objects(prefix, delimiter, token.as_deref())
                .unwrap();
            pages += 1;
            objects.extend(page.objects.into_iter().map(|e| e.name));
            prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        (objects, prefixes, pages)
    }

    #[test]
    fn put_then_get() {
        let client = MemoryBlobClient::new();
        client.put_bytes("a/b", b"hello", Precondition::None).unwrap();
        assert_eq!(client.get_object("a/b").unwrap(), b"hello");
        assert_eq!(client.head_object("a/b").unwrap(), Some(5));
        assert_eq!(client.head_object("a/c").unwrap(), None);
    }

    #[test]
    fn conditional_put_rejects_existing() {
        let client = MemoryBlobClient::new();
        client.put_bytes("k", b"1", Precondition::IfNotExists).unwrap();
        let err = client
            .put_bytes("k", b"2", Precondition::IfNotExists)
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::PreconditionFailed);
        assert_eq!(client.get_object("k").unwrap(), b"1");
    }

    #[test]
    fn uncommitted_upload_is_invisible() {
        let client = MemoryBlobClient::new();
        let mut upload = client.put_object("k", Precondition::None, None).unwrap();
        upload.write_all(b"partial").unwrap();
        drop(upload);
        assert!(client.is_empty());
    }

    #[test]
    fn range_read_starts_at_offset() {
        let client = seeded(10, &[]);
        client.insert_raw("blob", b"0123456789".to_vec());
        let mut out = String::new();
        client
            .range_read("blob", 4)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "456789");
        assert!(client.range_read("nope", 0).err().unwrap().is_not_found());
    }

    #[test]
    fn flat_listing_paginates() {
        let names: Vec<String> = (0..25).map(|i| format!("p/obj{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let client = seeded(10, &refs);
        client.insert_raw("q/other", vec![]);

        let (objects, prefixes, pages) = drain(&client, "p/", None);
        assert_eq!(objects, names);
        assert!(prefixes.is_empty());
        assert_eq!(pages, 3);
    }

    #[test]
    fn delimiter_listing_groups_prefixes_across_pages() {
        let client = seeded(
            2,
            &[
                "r/a/1", "r/a/2", "r/a/3", "r/b/1", "r/c/x/1", "r/top1", "r/top2",
            ],
        );
        let (objects, prefixes, _) = drain(&client, "r/", Some("/"));
        assert_eq!(prefixes, vec!["r/a/", "r/b/", "r/c/"]);
        assert_eq!(objects, vec!["r/top1", "r/top2"]);
    }

    proptest::proptest! {
        #[test]
        fn paging_never_changes_the_listing(
            names in proptest::collection::btree_set("[ab]{1,2}(/[ab]{1,2}){0,2}", 0..40),
            page_size in 1usize..8,
        ) {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let paged = seeded(page_size, &refs);
            let whole = seeded(usize::MAX, &refs);
            for delimiter in [None, Some("/")] {
                let (objects, prefixes, _) = drain(&paged, "", delimiter);
                let (all_objects, all_prefixes, pages) = drain(&whole, "", delimiter);
                proptest::prop_assert_eq!(pages, 1);
                proptest::prop_assert_eq!(objects, all_objects);
                proptest::prop_assert_eq!(prefixes, all_prefixes);
            }
        }
    }

    #[test]
    fn delete_reports_missing() {
        let client = seeded(10, &["x"]);
        let results = client.delete_objects(&["x".into(), "y".into()]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.as_ref().unwrap_err().is_not_found());
        assert!(client.is_empty());
    }
}
