use std::collections::HashMap;

use crate::job::{CachedFile, Job};

struct Entry {
    data: Vec<u8>,
    manifest: CachedFile,
}

/// Worker-local memoization of input payloads, keyed by file name.
///
/// Owned by a single worker loop; entries live for the whole process.
#[derive(Default)]
pub struct FileCache {
    files: HashMap<String, Entry>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.files.keys()).finish()
    }
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|e| e.data.as_slice())
    }

    pub fn put(&mut self, name: impl Into<String>, data: Vec<u8>) {
        let name = name.into();
        let manifest = CachedFile::new(name.as_str(), &data);
        self.files.insert(name, Entry { data, manifest });
    }

    /// What the queue may leave out of the next job it sends.
    pub fn manifest(&self) -> Vec<CachedFile> {
        let mut manifest: Vec<_> = self.files.values().map(|e| e.manifest.clone()).collect();
        manifest.sort_by(|a, b| a.name.cmp(&b.name));
        manifest
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Fills the job's missing infiles from the cache, then records every
    /// cache-marked infile that carries data.
    pub fn merge_into(&mut self, job: &mut Job) {
        for (name, entry) in &self.files {
            if job.fill_infile(name, &entry.data) {
                tracing::debug!(job = %job.id, file = %name, "using cached infile");
            }
        }

        for file in &job.infiles {
            if !file.cache {
                continue;
            }
            if let Some(data) = &file.data {
                if self.get(&file.name) != Some(data.as_slice()) {
                    self.put(file.name.clone(), data.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_fills_later_jobs() {
        let mut cache = FileCache::new();

        let mut first = Job::new(["cycdriver"]);
        first.add_infile("tmpl.xml", b"template".to_vec(), true);
        first.add_infile("scen.json", b"scenario-1".to_vec(), false);
        cache.merge_into(&mut first);
        let manifest = cache.manifest();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name, "tmpl.xml");

        let mut second = Job::new(["cycdriver"]);
        second.add_cached_ref("tmpl.xml");
        second.add_infile("other.xml", b"other".to_vec(), true);
        cache.merge_into(&mut second);

        let tmpl = second.infiles.iter().find(|f| f.name == "tmpl.xml").unwrap();
        assert_eq!(tmpl.data.as_deref(), Some(&b"template"[..]));
        assert_eq!(cache.get("tmpl.xml"), Some(&b"template"[..]));
        assert_eq!(cache.get("other.xml"), Some(&b"other"[..]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn explicit_data_is_not_replaced_by_cache() {
        let mut cache = FileCache::new();
        cache.put("tmpl.xml", b"old".to_vec());

        let mut job = Job::new(["cycdriver"]);
        job.add_infile("tmpl.xml", b"new".to_vec(), false);
        cache.merge_into(&mut job);

        assert_eq!(job.infiles.len(), 1);
        assert_eq!(job.infiles[0].data.as_deref(), Some(&b"new"[..]));
        // not cache-marked, so the cache keeps its entry
        assert_eq!(cache.get("tmpl.xml"), Some(&b"old"[..]));
    }

    #[test]
    fn uncached_refs_stay_empty() {
        let mut cache = FileCache::new();
        let mut job = Job::new(["true"]);
        job.add_cached_ref("missing");
        cache.merge_into(&mut job);
        assert!(job.infiles[0].data.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn new_payload_under_a_cached_name_replaces_it() {
        let mut cache = FileCache::new();
        cache.put("tmpl.xml", b"OLD".to_vec());
        let before = cache.manifest();

        let mut job = Job::new(["cat", "tmpl.xml"]);
        job.add_infile("tmpl.xml", b"NEW".to_vec(), true);
        cache.merge_into(&mut job);

        assert_eq!(job.infiles[0].data.as_deref(), Some(&b"NEW"[..]));
        assert_eq!(cache.get("tmpl.xml"), Some(&b"NEW"[..]));
        assert_ne!(cache.manifest(), before);
        assert!(cache.manifest()[0].holds(&job.infiles[0]));
    }
}
