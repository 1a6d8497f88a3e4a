//! Simulated datastore browser and file manager

use crate::domain::path::DatastorePath;
use crate::domain::ports::DatastoreBrowser;
use crate::error::{Error, Result};
use crate::sim::SimulatedCluster;
use async_trait::async_trait;

#[async_trait]
impl DatastoreBrowser for SimulatedCluster {
    async fn file_exists(&self, path: &DatastorePath) -> Result<bool> {
        let mut state = self.state().write();
        state.check("file.exists")?;
        let ds = state.datastore(path.datastore())?;
        Ok(ds.tree.files.contains_key(path.relative()))
    }

    async fn folder_exists(&self, path: &DatastorePath) -> Result<bool> {
        let mut state = self.state().write();
        state.check("file.folder_exists")?;
        let ds = state.datastore(path.datastore())?;
        Ok(ds.tree.folder_exists(path.relative()))
    }

    async fn make_directory(&self, path: &DatastorePath) -> Result<()> {
        let mut state = self.state().write();
        state.check("file.mkdir")?;
        let ds = state.datastore_mut(path.datastore())?;
        if ds.tree.files.contains_key(path.relative()) {
            return Err(Error::already_exists("File", path.to_string()));
        }
        if ds.tree.folder_exists(path.relative()) {
            return Ok(());
        }
        ds.tree.ensure_folder(path.relative());
        state.record("file.mkdir", path.to_string());
        Ok(())
    }

    async fn move_file(&self, from: &DatastorePath, to: &DatastorePath) -> Result<()> {
        let mut state = self.state().write();
        state.check("file.move")?;

        if state.file(from).is_none() {
            return Err(Error::not_found("File", from.to_string()));
        }
        if state.file(to).is_some() {
            return Err(Error::already_exists("File", to.to_string()));
        }
        if !state.datastore(to.datastore())?.tree.parent_exists(to.relative()) {
            return Err(Error::not_found("Folder", to.parent().map(|p| p.to_string()).unwrap_or_default()));
        }

        let file = state
            .remove_file(from)
            .ok_or_else(|| Error::not_found("File", from.to_string()))?;
        state.insert_file(to, file)?;
        state.relink(from, to);
        state.record("file.move", format!("{} -> {}", from, to));
        Ok(())
    }

    async fn delete_file(&self, path: &DatastorePath) -> Result<()> {
        let mut state = self.state().write();
        state.check("file.delete")?;
        state
            .remove_file(path)
            .ok_or_else(|| Error::not_found("File", path.to_string()))?;
        state.record("file.delete", path.to_string());
        Ok(())
    }

    async fn delete_folder(&self, path: &DatastorePath) -> Result<()> {
        let mut state = self.state().write();
        state.check("file.delete_folder")?;
        if path.is_root() {
            return Err(Error::Validation(format!("refusing to delete datastore root {}", path)));
        }
        let ds = state.datastore_mut(path.datastore())?;
        if !ds.tree.folder_exists(path.relative()) {
            return Err(Error::not_found("Folder", path.to_string()));
        }
        ds.tree.remove_folder(path.relative());
        state.record("file.delete_folder", path.to_string());
        Ok(())
    }

    async fn list_folder(&self, path: &DatastorePath) -> Result<Vec<String>> {
        let mut state = self.state().write();
        state.check("file.list")?;
        let ds = state.datastore(path.datastore())?;
        if !ds.tree.folder_exists(path.relative()) {
            return Err(Error::not_found("Folder", path.to_string()));
        }
        Ok(ds.tree.children(path.relative()))
    }

    async fn search(
        &self,
        datastore: &str,
        file_name: &str,
        exclude: &[String],
        max_depth: usize,
    ) -> Result<Vec<DatastorePath>> {
        let mut state = self.state().write();
        state.check("file.search")?;
        let ds = state.datastore(datastore)?;

        Ok(ds
            .tree
            .files
            .keys()
            .filter(|relative| {
                let mut parts: Vec<&str> = relative.split('/').collect();
                let name = parts.pop().unwrap_or_default();
                name == file_name
                    && parts.len() <= max_depth
                    && !parts.iter().any(|p| exclude.iter().any(|e| e == p))
            })
            .map(|relative| DatastorePath::new(datastore, relative.as_str()))
            .collect())
    }

    async fn file_size(&self, path: &DatastorePath) -> Result<u64> {
        let mut state = self.state().write();
        state.check("file.size")?;
        state
            .file(path)
            .map(|f| f.size)
            .ok_or_else(|| Error::not_found("File", path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sim() -> SimulatedCluster {
        SimulatedCluster::builder()
            .cluster("c1", 1)
            .local_datastore("ds1", "c1", 1 << 40)
            .build()
    }

    fn p(s: &str) -> DatastorePath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_move_requires_destination_folder() {
        let sim = sim();
        sim.put_file(&p("[ds1] a.vmdk"), 1);

        let err = sim.move_file(&p("[ds1] a.vmdk"), &p("[ds1] vm/a.vmdk")).await.unwrap_err();
        assert!(err.is_not_found());

        sim.make_directory(&p("[ds1] vm")).await.unwrap();
        sim.make_directory(&p("[ds1] vm")).await.unwrap();
        sim.move_file(&p("[ds1] a.vmdk"), &p("[ds1] vm/a.vmdk")).await.unwrap();
        assert_eq!(sim.list_files("ds1"), vec!["vm/a.vmdk"]);

        sim.put_file(&p("[ds1] a.vmdk"), 1);
        assert_matches!(
            sim.move_file(&p("[ds1] a.vmdk"), &p("[ds1] vm/a.vmdk")).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_search_respects_depth_and_exclusions() {
        let sim = sim();
        sim.put_file(&p("[ds1] a/b/c/d/x.vmdk"), 1);
        sim.put_file(&p("[ds1] a/x.vmdk"), 1);
        sim.put_file(&p("[ds1] .lck/x.vmdk"), 1);

        let found = sim.search("ds1", "x.vmdk", &[".lck".to_string()], 3).await.unwrap();
        assert_eq!(found, vec![p("[ds1] a/x.vmdk")]);
    }

    #[tokio::test]
    async fn test_list_and_delete_folder() {
        let sim = sim();
        sim.put_file(&p("[ds1] vm/a.vmdk"), 1);
        sim.put_file(&p("[ds1] vm/sub/b.vmdk"), 1);

        assert_eq!(sim.list_folder(&p("[ds1] vm")).await.unwrap(), vec!["a.vmdk", "sub"]);
        sim.delete_folder(&p("[ds1] vm")).await.unwrap();
        assert!(sim.list_files("ds1").is_empty());
        assert!(!sim.folder_exists(&p("[ds1] vm")).await.unwrap());
    }
}
